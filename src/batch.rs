use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Instant;

use image::RgbImage;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::config::ModelConfig;
use crate::imaging::{self, ImagingError};
use crate::jobs::EditJob;
use crate::pipelines::{EditModel, EditPipeline, PipelineError};
use crate::schedulers::Scheduler;

pub struct BatchRunner<'p, 'm, M> {
    pipeline: &'p EditPipeline<'m, M>,
    output_dir: PathBuf,
    resolution: u32,
    instruction: Box<dyn Fn(&str) -> String + 'p>,
    progress: bool,
}

impl<'p, 'm, M: EditModel> BatchRunner<'p, 'm, M> {
    pub fn new(
        pipeline: &'p EditPipeline<'m, M>,
        output_dir: impl Into<PathBuf>,
        resolution: u32,
    ) -> Self {
        let config = ModelConfig::default();
        Self {
            pipeline,
            output_dir: output_dir.into(),
            resolution,
            instruction: Box::new(move |object: &str| config.instruction(object)),
            progress: true,
        }
    }

    pub fn with_instruction(mut self, instruction: impl Fn(&str) -> String + 'p) -> Self {
        self.instruction = Box::new(instruction);
        self
    }

    pub fn with_no_progress(mut self) -> Self {
        self.progress = false;
        self
    }

    pub fn instruction(&self, object: &str) -> String {
        (self.instruction)(object)
    }

    /// Every background is loaded before the first edit, so an unreadable
    /// image aborts the run without writing any output.
    pub fn run(
        &self,
        scheduler: &mut impl Scheduler,
        jobs: &[EditJob],
    ) -> Result<Vec<PathBuf>, BatchError> {
        let backgrounds = self.load_backgrounds(jobs)?;
        fs::create_dir_all(&self.output_dir).map_err(|source| BatchError::OutputDir {
            path: self.output_dir.clone(),
            source,
        })?;

        let progress = if self.progress {
            let bar = ProgressBar::new(jobs.len() as u64);
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar
        } else {
            ProgressBar::hidden()
        };

        let started = Instant::now();
        let mut written = Vec::with_capacity(jobs.len());
        for (index, (job, background)) in jobs.iter().zip(&backgrounds).enumerate() {
            progress.set_message(job.filename.clone());
            let path = self
                .run_job(scheduler, job, background)
                .map_err(|source| BatchError::Job {
                    index,
                    filename: job.filename.clone(),
                    source,
                })?;
            written.push(path);
            progress.inc(1);
        }
        progress.finish_and_clear();

        tracing::info!(
            jobs = written.len(),
            elapsed = started.elapsed().as_secs_f32(),
            output_dir = %self.output_dir.display(),
            "batch finished"
        );
        Ok(written)
    }

    fn load_backgrounds(&self, jobs: &[EditJob]) -> Result<Vec<RgbImage>, BatchError> {
        jobs.iter()
            .enumerate()
            .map(|(index, job)| {
                imaging::load_background(&job.bg_image_path, self.resolution).map_err(|err| {
                    BatchError::Job {
                        index,
                        filename: job.filename.clone(),
                        source: err.into(),
                    }
                })
            })
            .collect()
    }

    fn run_job(
        &self,
        scheduler: &mut impl Scheduler,
        job: &EditJob,
        background: &RgbImage,
    ) -> Result<PathBuf, JobFailure> {
        let started = Instant::now();
        let instruction = self.instruction(&job.object_to_add);
        tracing::debug!(
            background = %job.bg_image_path.display(),
            %instruction,
            "editing background"
        );

        let edited = self.pipeline.execute(scheduler, background, &instruction)?;
        let path = job.output_path(&self.output_dir);
        imaging::save_png(&edited, &path)?;

        tracing::info!(
            output = %path.display(),
            elapsed = started.elapsed().as_secs_f32(),
            "wrote edited image"
        );
        Ok(path)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobFailure {
    #[error("{0}")]
    Image(#[from] ImagingError),
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BatchError {
    #[error("failed to create output directory {path}: {source}")]
    OutputDir { path: PathBuf, source: io::Error },
    #[error("job {index} ({filename}) failed: {source}")]
    Job {
        index: usize,
        filename: String,
        source: JobFailure,
    },
}
