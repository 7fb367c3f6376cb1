use std::path::Path;

use thiserror::Error;
use tokenizers::Tokenizer;

pub(crate) type Token = i32;

const END_OF_TEXT: &str = "<|endoftext|>";

#[derive(Debug)]
pub struct ClipTokenizer {
    inner: Tokenizer,
    end_token: Token,
    pad_token: Token,
    max_length: usize,
}

impl ClipTokenizer {
    pub fn open(directory: impl AsRef<Path>, max_length: usize) -> Result<Self, TokenizerError> {
        let path = directory.as_ref().join("tokenizer.json");
        let inner =
            Tokenizer::from_file(&path).map_err(|err| TokenizerError::Load(err.to_string()))?;
        Self::new(inner, max_length)
    }

    pub fn new(inner: Tokenizer, max_length: usize) -> Result<Self, TokenizerError> {
        if max_length < 2 {
            return Err(TokenizerError::InvalidMaxLength(max_length));
        }
        let end_token = inner
            .token_to_id(END_OF_TEXT)
            .ok_or(TokenizerError::MissingEndToken)?;
        let pad_token = inner
            .get_padding()
            .map(|padding| padding.pad_id)
            .unwrap_or(end_token);

        Ok(Self {
            inner,
            end_token: to_token(end_token)?,
            pad_token: to_token(pad_token)?,
            max_length,
        })
    }

    pub fn encode(&self, text: &str) -> Result<Vec<Token>, TokenizerError> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|err| TokenizerError::Encode(err.to_string()))?;
        let mut tokens = encoding
            .get_ids()
            .iter()
            .map(|&id| to_token(id))
            .collect::<Result<Vec<_>, _>>()?;

        if tokens.len() > self.max_length {
            tokens.truncate(self.max_length);
            if let Some(last) = tokens.last_mut() {
                *last = self.end_token;
            }
        }
        tokens.resize(self.max_length, self.pad_token);
        Ok(tokens)
    }
}

fn to_token(id: u32) -> Result<Token, TokenizerError> {
    Token::try_from(id).map_err(|_| TokenizerError::TokenOutOfRange(id))
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenizerError {
    #[error("failed to load tokenizer: {0}")]
    Load(String),
    #[error("failed to encode prompt: {0}")]
    Encode(String),
    #[error("missing end token in the vocabulary")]
    MissingEndToken,
    #[error("token id {0} does not fit the text encoder input")]
    TokenOutOfRange(u32),
    #[error("maximum text length must be at least 2, got {0}")]
    InvalidMaxLength(usize),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    use super::*;

    fn word_level(max_length: usize) -> ClipTokenizer {
        let vocab: HashMap<String, u32> = [
            ("<|startoftext|>", 0),
            (END_OF_TEXT, 1),
            ("[UNK]", 2),
            ("add", 3),
            ("a", 4),
            ("cat", 5),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_owned())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Whitespace {});
        ClipTokenizer::new(tokenizer, max_length).unwrap()
    }

    #[test]
    fn pads_with_end_token() {
        let tokenizer = word_level(6);
        assert_eq!(tokenizer.encode("add a cat").unwrap(), vec![3, 4, 5, 1, 1, 1]);
    }

    #[test]
    fn empty_prompt_is_all_padding() {
        let tokenizer = word_level(4);
        assert_eq!(tokenizer.encode("").unwrap(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn truncation_keeps_end_token() {
        let tokenizer = word_level(2);
        assert_eq!(tokenizer.encode("add a cat").unwrap(), vec![3, 1]);
    }
}
