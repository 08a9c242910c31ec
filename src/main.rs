use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use clap::Parser;

use rusty_cyto::data::loader::load_setup;
use rusty_cyto::{
    Estimate, Experiment, MixtureModelOp, MixtureSettings, Operation, Predicate, TransformOp,
    Value, TUBE_COLUMN,
};

/// Hlog-transform channels, fit a Gaussian mixture per group and print the
/// population breakdown.
#[derive(Parser, Debug)]
#[command(name = "rusty-cyto", version, about)]
struct Args {
    /// Setup file listing samples and their conditions
    setup: PathBuf,

    /// Channels to cluster on
    #[arg(required = true, num_args = 1..)]
    channels: Vec<String>,

    /// Column whose values separate independently fitted groups
    #[arg(short, long, default_value = TUBE_COLUMN)]
    group_by: String,

    /// Number of populations per group
    #[arg(short = 'k', long, default_value_t = 2)]
    populations: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = 100)]
    max_iter: usize,

    /// Only fit on events matching this expression, e.g. "`FSC-A` > 1000"
    #[arg(long)]
    subset: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let experiment = load_setup(&args.setup)?;
    let channels: Vec<&str> = args.channels.iter().map(String::as_str).collect();
    let transformed = TransformOp::hlog("hlog", &channels)
        .apply(&experiment)
        .context("hlog transform")?;

    let mut gmm = MixtureModelOp::new("GMM", &channels, args.populations, "hlog", &args.group_by)
        .with_settings(MixtureSettings {
            seed: args.seed,
            max_iter: args.max_iter,
            ..MixtureSettings::default()
        });
    let subset = args.subset.as_deref().map(Predicate::parse).transpose()?;
    gmm.estimate(&transformed, subset.as_ref())
        .context("estimating mixture model")?;
    let result = gmm.apply(&transformed).context("applying mixture model")?;

    let summary = summarize(&result, &gmm)?;
    println!("{}", pretty_format_batches(&[summary])?);
    Ok(())
}

/// One row per (group, population): event count and fitted channel means.
fn summarize(result: &Experiment, gmm: &MixtureModelOp) -> Result<RecordBatch> {
    let classes = result[gmm.name()]
        .as_i64()
        .context("classification column is not integer")?;
    let mut counts: BTreeMap<(Value, i64), i64> = BTreeMap::new();
    for (group, rows) in result.group_rows(&gmm.group_by)? {
        for row in rows {
            *counts.entry((group.clone(), classes[row])).or_default() += 1;
        }
    }

    let mut groups = Vec::new();
    let mut populations = Vec::new();
    let mut events = Vec::new();
    let mut means: Vec<Vec<f64>> = vec![Vec::new(); gmm.channels.len()];
    for ((group, population), count) in &counts {
        let model = gmm
            .model(group)
            .with_context(|| format!("no model for group {group}"))?;
        let mean = &model.means()[*population as usize];
        groups.push(group.to_string());
        populations.push(*population);
        events.push(*count);
        for (column, value) in means.iter_mut().zip(mean) {
            column.push(*value);
        }
    }

    let mut fields = vec![
        Field::new(gmm.group_by.as_str(), DataType::Utf8, false),
        Field::new("population", DataType::Int64, false),
        Field::new("events", DataType::Int64, false),
    ];
    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(groups)),
        Arc::new(Int64Array::from(populations)),
        Arc::new(Int64Array::from(events)),
    ];
    for (channel, values) in gmm.channels.iter().zip(means) {
        fields.push(Field::new(format!("mean {channel}"), DataType::Float64, false));
        arrays.push(Arc::new(Float64Array::from(values)));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}
