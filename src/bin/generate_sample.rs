use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CHANNELS: [&str; 3] = ["FSC-A", "Y2-A", "B1-A"];

/// Box-Muller transform for normal distribution
fn gauss(rng: &mut StdRng, mean: f64, std_dev: f64) -> f64 {
    let u1 = rng.random::<f64>().max(1e-15);
    let u2 = rng.random::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + std_dev * z
}

/// Events from a dim and a bright population; `bright` is the bright fraction.
/// Fluorescence is lognormal, scatter is normal.
fn generate_events(n: usize, bright: f64, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut columns = vec![Vec::with_capacity(n); CHANNELS.len()];
    for _ in 0..n {
        let is_bright = rng.random::<f64>() < bright;
        let (y2, b1) = if is_bright { (4.0, 3.2) } else { (2.0, 2.5) };
        columns[0].push(gauss(rng, 50_000.0, 8_000.0));
        columns[1].push(10f64.powf(gauss(rng, y2, 0.15)));
        columns[2].push(10f64.powf(gauss(rng, b1, 0.2)));
    }
    columns
}

fn write_parquet(path: &Path, columns: Vec<Vec<f64>>) -> Result<()> {
    let schema = Arc::new(Schema::new(
        CHANNELS
            .iter()
            .map(|c| Field::new(*c, DataType::Float64, false))
            .collect::<Vec<_>>(),
    ));
    let arrays: Vec<ArrayRef> = columns
        .into_iter()
        .map(|c| Arc::new(Float64Array::from(c)) as ArrayRef)
        .collect();
    let batch = RecordBatch::try_new(schema.clone(), arrays).context("building record batch")?;

    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating writer")?;
    writer.write(&batch).context("writing batch")?;
    writer.close().context("closing writer")?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let out_dir = PathBuf::from(std::env::args().nth(1).unwrap_or_else(|| ".".to_string()));
    std::fs::create_dir_all(&out_dir).context("creating output directory")?;

    let mut rng = StdRng::seed_from_u64(42);
    let samples = [("A3", 10.0, 0.7), ("A4", 1.0, 0.3), ("B3", 10.0, 0.65), ("B4", 0.0, 0.05)];

    let mut setup = String::from("filename,Dox,Well\nstring,float,string\n");
    for (well, dox, bright) in samples {
        let file = format!("{well}.parquet");
        write_parquet(&out_dir.join(&file), generate_events(5_000, bright, &mut rng))?;
        setup.push_str(&format!("{file},{dox},{well}\n"));
        log::info!("wrote {file}");
    }

    let setup_path = out_dir.join("setup.csv");
    std::fs::write(&setup_path, setup).context("writing setup file")?;
    println!(
        "Wrote {} samples and {}",
        samples.len(),
        setup_path.display()
    );
    Ok(())
}
