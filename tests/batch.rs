use std::fs;
use std::path::Path;

use image::{Rgb, RgbImage};
use ndarray::{Array3, Array4, ArrayView1, ArrayView3, ArrayView4, Axis};
use placement::batch::{BatchError, BatchRunner, JobFailure};
use placement::imaging::ImagingError;
use placement::jobs::{read_jobs, EditJob};
use placement::pipelines::{ConditioningPair, EditModel, EditPipeline, EditSettings, PipelineError};
use placement::schedulers::{Euler, EulerAncestral, NoiseSchedule};
use placement::ModelConfig;
use pretty_assertions::assert_eq;

const RESOLUTION: u32 = 64;

#[derive(Debug)]
struct Synthetic;

impl EditModel for Synthetic {
    fn encode_text(&self, text: &str) -> Result<Array3<f32>, PipelineError> {
        let bytes = text.as_bytes();
        Ok(Array3::from_shape_fn((1, 4, 8), |(_, t, h)| {
            bytes.get(t * 8 + h).map_or(0., |&b| f32::from(b) / 255.)
        }))
    }

    fn encode_image(&self, pixels: ArrayView4<'_, f32>) -> Result<Array4<f32>, PipelineError> {
        let (batch, _, height, width) = pixels.dim();
        Ok(Array4::from_shape_fn(
            (batch, 4, height / 8, width / 8),
            |(b, c, y, x)| pixels[[b, c % 3, y * 8, x * 8]],
        ))
    }

    fn predict_noise(
        &self,
        latent: ArrayView4<'_, f32>,
        _timesteps: ArrayView1<'_, f32>,
        text: ArrayView3<'_, f32>,
        image: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>, PipelineError> {
        let mut eps = &latent * 0.5 + &image * 0.2;
        for (mut item, text) in eps.outer_iter_mut().zip(text.outer_iter()) {
            let bias = text.mean().unwrap_or(0.) * 0.1;
            item.mapv_inplace(|v| v + bias);
        }
        Ok(eps)
    }

    fn decode_latents(&self, latent: ArrayView4<'_, f32>) -> Result<Array4<f32>, PipelineError> {
        let (batch, _, height, width) = latent.dim();
        Ok(Array4::from_shape_fn(
            (batch, 3, height * 8, width * 8),
            |(b, c, y, x)| latent[[b, c, y / 8, x / 8]].tanh(),
        ))
    }
}

fn write_background(path: &Path, width: u32, height: u32, tint: u8) {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 3) as u8, (y * 5) as u8, tint])
    })
    .save(path)
    .unwrap();
}

fn jobs_in(dir: &Path) -> Vec<EditJob> {
    write_background(&dir.join("wide.png"), 120, 40, 10);
    write_background(&dir.join("tall.png"), 30, 90, 200);
    let table = format!(
        "bg_image_path,object_to_add,filename\n\
         {0}/wide.png,potted plant,wide_plant\n\
         {0}/tall.png,\"lamp, brass\",tall_lamp\n\
         {0}/wide.png,cat,wide_cat\n",
        dir.display()
    );
    read_jobs(table.as_bytes()).unwrap()
}

fn settings() -> EditSettings {
    EditSettings::default().with_steps(6).with_seed(1234)
}

#[test]
fn writes_one_png_per_row() {
    let inputs = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let jobs = jobs_in(inputs.path());
    let config = ModelConfig::default();

    let pipeline = EditPipeline::new(&Synthetic, NoiseSchedule::default(), settings()).unwrap();
    let written = BatchRunner::new(&pipeline, output.path().join("nested"), RESOLUTION)
        .with_instruction(|object| config.instruction(object))
        .with_no_progress()
        .run(&mut EulerAncestral, &jobs)
        .unwrap();

    let mut names: Vec<_> = fs::read_dir(output.path().join("nested"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["tall_lamp.png", "wide_cat.png", "wide_plant.png"]);
    assert_eq!(written.len(), 3);

    for path in written {
        let image = image::open(&path).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (RESOLUTION, RESOLUTION));
    }
}

#[test]
fn fixed_seed_is_byte_identical_across_runs() {
    let inputs = tempfile::tempdir().unwrap();
    let jobs = jobs_in(inputs.path());
    let pipeline = EditPipeline::new(&Synthetic, NoiseSchedule::default(), settings()).unwrap();

    let run = || {
        let output = tempfile::tempdir().unwrap();
        BatchRunner::new(&pipeline, output.path(), RESOLUTION)
            .with_no_progress()
            .run(&mut EulerAncestral, &jobs)
            .unwrap()
            .iter()
            .map(|path| fs::read(path).unwrap())
            .collect::<Vec<_>>()
    };

    assert_eq!(run(), run());
}

#[test]
fn every_job_starts_from_the_same_noise() {
    let pipeline = EditPipeline::new(&Synthetic, NoiseSchedule::default(), settings()).unwrap();
    let background = RgbImage::from_pixel(RESOLUTION, RESOLUTION, Rgb([40, 80, 120]));
    let pixels = placement::imaging::image_to_tensor(&background).unwrap();
    let null_text = Synthetic.encode_text("").unwrap();
    let conditioning =
        ConditioningPair::build(&Synthetic, pixels.view(), "add a cat", &null_text).unwrap();

    let first = pipeline.sample(&mut EulerAncestral, &conditioning).unwrap();
    let second = pipeline.sample(&mut EulerAncestral, &conditioning).unwrap();
    assert_eq!(first, second);

    let reseeded = EditPipeline::new(
        &Synthetic,
        NoiseSchedule::default(),
        settings().with_seed(4321),
    )
    .unwrap();
    assert_ne!(first, reseeded.sample(&mut EulerAncestral, &conditioning).unwrap());
}

#[test]
fn euler_sampler_is_deterministic() {
    let background = RgbImage::from_pixel(RESOLUTION, RESOLUTION, Rgb([200, 10, 90]));
    let pixels = placement::imaging::image_to_tensor(&background).unwrap();
    let null_text = Synthetic.encode_text("").unwrap();
    let conditioning =
        ConditioningPair::build(&Synthetic, pixels.view(), "add a dog", &null_text).unwrap();

    let sample = |seed| {
        EditPipeline::new(&Synthetic, NoiseSchedule::default(), settings().with_seed(seed))
            .unwrap()
            .sample(&mut Euler, &conditioning)
            .unwrap()
    };
    let latent = sample(7);
    assert_eq!(latent.len_of(Axis(1)), 4);
    assert!(latent.iter().all(|v| v.is_finite()));
    assert_eq!(latent, sample(7));
}

#[test]
fn missing_background_aborts_the_batch() {
    let inputs = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_background(&inputs.path().join("ok.png"), 64, 64, 0);
    let table = format!(
        "bg_image_path,object_to_add,filename\n\
         {0}/ok.png,vase,first\n\
         {0}/missing.png,vase,second\n\
         {0}/ok.png,vase,third\n",
        inputs.path().display()
    );
    let jobs = read_jobs(table.as_bytes()).unwrap();
    let pipeline = EditPipeline::new(&Synthetic, NoiseSchedule::default(), settings()).unwrap();

    let err = BatchRunner::new(&pipeline, output.path(), RESOLUTION)
        .with_no_progress()
        .run(&mut EulerAncestral, &jobs)
        .unwrap_err();

    match err {
        BatchError::Job {
            index,
            filename,
            source: JobFailure::Image(ImagingError::Open { .. }),
        } => {
            assert_eq!(index, 1);
            assert_eq!(filename, "second");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!output.path().join("first.png").exists());
    assert!(!output.path().join("third.png").exists());
}

#[test]
fn default_instruction_uses_the_edit_template() {
    let pipeline = EditPipeline::new(&Synthetic, NoiseSchedule::default(), settings()).unwrap();
    let runner = BatchRunner::new(&pipeline, "unused", RESOLUTION);
    assert_eq!(
        runner.instruction("cat"),
        "add a cat, image quality is five out of five"
    );

    let runner = runner.with_instruction(|object| format!("put a {object} here"));
    assert_eq!(runner.instruction("lamp"), "put a lamp here");
}

#[test]
fn zero_steps_are_rejected() {
    let err = EditPipeline::new(&Synthetic, NoiseSchedule::default(), settings().with_steps(0))
        .unwrap_err();
    assert!(matches!(err, PipelineError::EmptySchedule));
}
