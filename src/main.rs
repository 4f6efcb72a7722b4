use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use log::info;

use delam_seg::{
    dataset_sources, evaluate, open_predictor, should_persist, Cli, Command, DensePredictor,
    DirectorySource, LabelGenerator, PairedStream, PersistDecision, PixelClassifier,
    PngLabelWriter, RunConfig, Trainer,
};

fn main() -> Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RunConfig::open(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => RunConfig::default(),
    };

    match cli.command {
        Command::Train {
            train_dir,
            val_dir,
            output,
            resume,
            history,
            yes,
        } => train(&config, &train_dir, &val_dir, output, resume, history, yes),
        Command::Evaluate {
            data_dir,
            model_path,
            steps,
            device_id,
            summary,
        } => {
            ensure!(model_path.exists(), "Model path does not exist");
            let model = open_predictor(&model_path, device_id)?;
            let (images, masks) = dataset_sources(&data_dir, &config);
            let mut stream = PairedStream::new(
                &images,
                &masks,
                None,
                config.evaluation_stream(),
                config.num_classes(),
            )?;
            let result = evaluate(
                &model,
                &mut stream,
                steps,
                config.loss,
                &config.metrics,
                &config.metric_context(),
            )?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let Some(path) = summary {
                result.write_json(&path)?;
            }
            Ok(())
        }
        Command::Predict {
            input_dir,
            output_dir,
            model_path,
            device_id,
        } => {
            ensure!(model_path.exists(), "Model path does not exist");
            ensure!(input_dir.exists(), "Input directory does not exist");
            let model = open_predictor(&model_path, device_id)?;
            let source = DirectorySource::new(&input_dir).with_color_mode(config.color_mode);
            let mut sink = PngLabelWriter::new(&output_dir, model.num_classes())?;
            let written = LabelGenerator::new(model)
                .with_progress(true)
                .run(&source, &mut sink)?;
            info!("{written} label maps written to {}", output_dir.display());
            Ok(())
        }
    }
}

fn train(
    config: &RunConfig,
    train_dir: &Path,
    val_dir: &Path,
    output: PathBuf,
    resume: Option<PathBuf>,
    history_path: Option<PathBuf>,
    yes: bool,
) -> Result<()> {
    let (train_images, train_masks) = dataset_sources(train_dir, config);

    let mut train_stream = PairedStream::new(
        &train_images,
        &train_masks,
        Some(config.augmentation.clone()),
        config.train_stream(),
        config.num_classes(),
    )
    .context("Failed to prepare training data")?;
    let mut val_stream = match config.validation_stream() {
        Some(stream_config) => {
            let (val_images, val_masks) = dataset_sources(val_dir, config);
            let stream = PairedStream::new(
                &val_images,
                &val_masks,
                None,
                stream_config,
                config.num_classes(),
            )
            .context("Failed to prepare validation data")?;
            Some(stream)
        }
        None => {
            info!("validation disabled, {} is not read", val_dir.display());
            None
        }
    };

    let mut model = match &resume {
        Some(path) => PixelClassifier::open(path)
            .with_context(|| format!("Failed to resume from {}", path.display()))?,
        None => PixelClassifier::new(
            config.input_shape(),
            config.num_classes(),
            config.loss,
            config.optimizer.clone(),
            config.seed,
        )?,
    };

    let trainer = Trainer::new(
        config.training.clone(),
        config.metrics.clone(),
        config.metric_context(),
    )?
    .with_progress(true);
    let history = trainer.fit(&mut model, &mut train_stream, val_stream.as_mut())?;

    if let Some(path) = history_path {
        history.write_json(&path)?;
        info!("history written to {}", path.display());
    }

    let decision = if yes {
        PersistDecision::Save(output)
    } else {
        prompt_persist(output)?
    };
    decision.apply(&model)?;
    Ok(())
}

fn prompt_persist(output: PathBuf) -> Result<PersistDecision> {
    let stdin = io::stdin();
    let mut lines = stdin.lock();
    loop {
        print!("Do you want to save the model to {}? (y/n): ", output.display());
        io::stdout().flush()?;

        let mut answer = String::new();
        if lines.read_line(&mut answer)? == 0 {
            bail!("Input closed before a save decision was made");
        }
        match should_persist(&answer) {
            Ok(true) => return Ok(PersistDecision::Save(output)),
            Ok(false) => return Ok(PersistDecision::Discard),
            Err(_) => println!("Please input only y or n"),
        }
    }
}
