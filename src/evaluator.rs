use std::thread;

use ndarray::Array2;

use crate::bundle::MetricBundle;
use crate::config::EvalConfig;
use crate::datalist::{partition, DataEntry, DataList};
use crate::distributed::{gather_concat, Collective, SingleProcess, ThreadGroup};
use crate::error::{Error, Result};
use crate::frame_loader::{FrameLoader, ImageLoader, VolumeFrameLoader};
use crate::metrics::{mean_per_object, nan_mean, MetricTable};
use crate::refinement::{refine_object, RefinementConfig};
use crate::video_predictor::VideoPredictor;
use crate::volume::Volume;

/// Combined results of every worker, with all-NaN volumes removed.
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub bundle: MetricBundle,
    /// Per-volume log lines of this worker, sorted.
    pub log_lines: Vec<String>,
}

impl EvaluationReport {
    pub fn best(&self) -> Array2<f32> {
        self.bundle.best()
    }

    pub fn log_summary(&self) {
        log_bundle_summary(&self.bundle);
    }
}

pub fn log_bundle_summary(bundle: &MetricBundle) {
    let best = bundle.best();
    for (i, (row, best_row)) in bundle.metric.values().outer_iter().zip(best.outer_iter()).enumerate() {
        log::debug!("object {i}: {:?}", row.outer_iter().map(|o| o.to_vec()).collect::<Vec<_>>());
        log::debug!("object {i}: {:?}", best_row.to_vec());
    }

    let best_per_object = mean_per_object(best.view());
    log::info!(
        "Best metric {:?}, best avg {}",
        best_per_object,
        nan_mean(&best_per_object)
    );

    let mean_points = bundle.points.mean_over_volumes();
    log::info!("point needed, mean is {:?}", mean_points.outer_iter().map(|o| o.to_vec()).collect::<Vec<_>>());
}

fn refinement_config(config: &EvalConfig) -> RefinementConfig {
    RefinementConfig {
        max_iters: config.max_iter,
        erosion_size: config.erosion_size,
        mask_threshold: config.mask_threshold,
        ..Default::default()
    }
}

fn frame_loader_for(volume: &Volume, config: &EvalConfig) -> Result<Box<dyn FrameLoader>> {
    if config.export_frames {
        let dir = config.frame_dir(&volume.frame_dir_name());
        volume.export_frames(&dir)?;
        Ok(Box::new(ImageLoader::new(&dir)?))
    } else {
        Ok(Box::new(VolumeFrameLoader::new(volume.image.clone())))
    }
}

/// Evaluates this worker's shard of `entries` and all-gathers the metrics, so
/// every worker returns the full report.
pub fn evaluate_worker<P, C>(
    predictor: &P,
    collective: &mut C,
    entries: &[DataEntry],
    label_set: &[u32],
    config: &EvalConfig,
) -> Result<EvaluationReport>
where
    P: VideoPredictor,
    C: Collective + ?Sized,
{
    if label_set.len() < 2 {
        return Err(Error::Config("label_set needs background plus at least one label".into()));
    }
    let objects = &label_set[1..];
    let refine = refinement_config(config);

    collective.barrier()?;
    let shard = partition(entries, collective.world_size(), collective.rank())?;
    log::debug!("worker {}: {} volumes", collective.rank(), shard.len());

    let mut metric = MetricTable::new(shard.len(), objects.len(), config.max_iter);
    let mut points = MetricTable::new(shard.len(), objects.len(), config.max_iter);
    let mut log_lines = Vec::new();

    for (index, entry) in shard.iter().enumerate() {
        let volume = Volume::load(&entry.image, &entry.label)?;
        let mut state = predictor.init_state(frame_loader_for(&volume, config)?)?;

        for (obj, &label_value) in objects.iter().enumerate() {
            let mask = volume.object_mask(label_value);
            if !mask.iter().any(|&v| v) {
                log::debug!("{}: label {label_value} absent, skipped", volume.id);
                continue;
            }

            for result in refine_object(predictor, &mut state, mask.view(), &refine)? {
                metric.set(index, obj, result.iteration, result.volume_dice);
                points.set(index, obj, result.iteration, result.num_points as f32);
            }
        }

        for iteration in 0..config.max_iter {
            let line = format!(
                "Validation Dice score : {iteration} / {} / {} / {}: {:?}",
                index + 1,
                shard.len(),
                volume.id,
                metric.iteration_row(index, iteration)
            );
            log::info!("{line}");
            log_lines.push(line);
        }
    }

    log_lines.sort();
    for line in &log_lines {
        log::debug!("{line}");
    }

    let metric = MetricTable::from_array(gather_concat(collective, metric.values())?);
    let points = MetricTable::from_array(gather_concat(collective, points.values())?);

    let keep = metric.computed_volumes();
    let bundle = MetricBundle {
        metric: metric.select_volumes(&keep),
        points: points.select_volumes(&keep),
    };

    Ok(EvaluationReport { bundle, log_lines })
}

/// Loads the data list, evaluates it on `config.num_workers` workers and, from
/// rank 0's view, logs the summary and saves the metric bundle.
///
/// `make_predictor` is called once per worker with its rank. A failing worker
/// fails the whole run.
pub fn run_evaluation<P, F>(config: &EvalConfig, make_predictor: F) -> Result<EvaluationReport>
where
    P: VideoPredictor,
    F: Fn(usize) -> Result<P> + Sync,
{
    config.validate()?;
    let label_set = config.resolve_label_set()?;
    let datalist = DataList::from_file(&config.data_list_file_path)?;
    let entries = datalist.select(
        &config.data_file_base_dir,
        config.list_key,
        config.fold,
        config.five_fold,
    );
    log::info!("Total files {}", entries.len());

    let report = if config.num_workers == 1 {
        let predictor = make_predictor(0)?;
        evaluate_worker(&predictor, &mut SingleProcess, &entries, &label_set, config)?
    } else {
        run_thread_group(config, &make_predictor, &entries, &label_set)?
    };

    report.log_summary();
    let bundle_path = config.bundle_path();
    report.bundle.save(&bundle_path)?;
    log::info!("saved metrics to {}", bundle_path.display());

    Ok(report)
}

fn run_thread_group<P, F>(
    config: &EvalConfig,
    make_predictor: &F,
    entries: &[DataEntry],
    label_set: &[u32],
) -> Result<EvaluationReport>
where
    P: VideoPredictor,
    F: Fn(usize) -> Result<P> + Sync,
{
    let groups = ThreadGroup::create(config.num_workers);

    let outcomes: Vec<Result<EvaluationReport>> = thread::scope(|s| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|mut group| {
                s.spawn(move || {
                    let outcome = make_predictor(group.rank()).and_then(|predictor| {
                        evaluate_worker(&predictor, &mut group, entries, label_set, config)
                    });
                    if let Err(e) = &outcome {
                        log::error!("worker {} failed: {e}", group.rank());
                        group.abort();
                    }
                    outcome
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(Error::Collective("worker panicked".into())))
            })
            .collect()
    });

    let mut reports = Vec::with_capacity(outcomes.len());
    let mut errors = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(report) => reports.push(report),
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        // the failure that caused the abort, not the peers' collective errors
        let root = errors
            .iter()
            .position(|e| !matches!(e, Error::Collective(_)))
            .unwrap_or(0);
        return Err(errors.swap_remove(root));
    }

    reports
        .into_iter()
        .next()
        .ok_or_else(|| Error::Collective("no worker returned a report".into()))
}
