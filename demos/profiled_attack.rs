use anyhow::{Context, Result};
use leakprof::{
    dataset::{Dataset, load_pois},
    leakage_model::{LeakageModel, linear_regression::LinearRegression, template::Template},
    resources::Resources,
    shape::all_candidates,
    util::rank,
};
use ndarray::{Array2, ArrayView2, ArrayView3, Axis, s};
use std::env;

#[cfg(feature = "progress_bar")]
use {indicatif::ProgressIterator, leakprof::util::progress_bar};

/// Number of attack traces added between two key rank evaluations.
const STEP: usize = 10;

/// Rank of the true key of each block, all channels combined.
fn key_ranks<M: LeakageModel>(
    model: &M,
    plaintexts: ArrayView2<u8>,
    traces: ArrayView3<f64>,
    keys: &[u8],
) -> Result<Vec<usize>> {
    let candidates = all_candidates(plaintexts.nrows());
    let scores = model
        .log_likelihood(plaintexts, traces, candidates.view())?
        .sum_axis(Axis(2));

    Ok(rank(scores.view())
        .outer_iter()
        .zip(keys)
        .map(|(order, &key)| {
            order
                .iter()
                .position(|&candidate| candidate == key as usize)
                .unwrap_or(order.len())
        })
        .collect())
}

fn attack<M: LeakageModel>(name: &str, model: &M, dataset: &Dataset, pois: &[usize]) -> Result<()> {
    let plaintexts = dataset.plaintexts();
    let traces = dataset.traces(pois)?;

    let key = model.get_key(plaintexts.view(), traces.view())?;
    println!("{name}: recovered key {}", hex(key.iter()));

    // Key rank evolution needs the key of the attack set
    let Some(keys) = dataset.keys().filter(|keys| !keys.is_empty()) else {
        return Ok(());
    };
    let true_key: Vec<u8> = keys.row(0).to_vec();

    let steps = (1..=dataset.len().div_ceil(STEP)).map(|i| (i * STEP).min(dataset.len()));
    #[cfg(feature = "progress_bar")]
    let steps = steps.progress_with(progress_bar(dataset.len().div_ceil(STEP)));

    let mut ranks = Vec::new();
    for n in steps {
        ranks.push(key_ranks(
            model,
            plaintexts.slice(s![.., ..n]),
            traces.slice(s![.., ..n, ..]),
            &true_key,
        )?);
    }

    let ranks = Array2::from_shape_fn((ranks.len(), true_key.len()), |(i, b)| ranks[i][b]);
    if let Some(n) = ranks
        .outer_iter()
        .position(|ranks| ranks.iter().all(|&rank| rank == 0))
    {
        println!(
            "{name}: full key ranked first after {} traces",
            ((n + 1) * STEP).min(dataset.len())
        );
    }
    println!("{name}: final ranks {}", ranks.row(ranks.nrows() - 1));

    Ok(())
}

fn hex<'a>(bytes: impl Iterator<Item = &'a u8>) -> String {
    bytes.map(|b| format!("{b:02x}")).collect()
}

fn main() -> Result<()> {
    env_logger::init();

    let manifest = env::var("RESOURCES").unwrap_or_else(|_| "resources.json".to_string());
    let resources = Resources::open(&manifest)
        .with_context(|| format!("Failed to read resource manifest {manifest}"))?;

    let profile = Dataset::load::<f64, _>(resources.path("profile")?)
        .context("Failed to load profiling set")?;
    let attack_set = Dataset::load::<f64, _>(resources.path("attack")?)
        .context("Failed to load attack set")?;
    let pois = load_pois(resources.path("poi")?).context("Failed to load points of interest")?;
    println!("{} points of interest", pois.len());

    let labels = profile
        .labels()
        .context("Profiling set has no keys.npy")?;
    let profiling_traces = profile.traces(&pois)?;

    let template = Template::fit(labels.view(), profiling_traces.view())?;
    attack("template", &template, &attack_set, &pois)?;

    let linear_regression = LinearRegression::fit(labels.view(), profiling_traces.view())?;
    attack("linear regression", &linear_regression, &attack_set, &pois)?;

    Ok(())
}
