//! End-to-end pipeline test: collect -> train (both folds) -> apply
//!
//! Builds a miniature source tree of Parquet files in a temporary directory:
//!
//! ```text
//! ntuples/<source>/mt_nominal.parquet   event, x, q, w
//! friends/<source>/mt_nominal.parquet   event, z
//! ```

use arrow::array::{Float64Array, Int32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use trueno_xfold::config::PipelineConfig;
use trueno_xfold::fold::{Artifact, Fold, Workdir};
use trueno_xfold::inference::{self, EVENT_COLUMN, INDEX_COLUMN, SCORE_COLUMN};
use trueno_xfold::sample::{collect_samples, TrainingSample};
use trueno_xfold::scan::ScanPool;
use trueno_xfold::storage::{column_f64, column_u64, StorageEngine};
use trueno_xfold::train::train_fold;
use trueno_xfold::tracking::{RunStatus, TrainingLog};
use trueno_xfold::Error;

fn write_parquet(path: &Path, batch: &RecordBatch) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
    writer.write(batch).unwrap();
    writer.close().unwrap();
}

/// Write one source: `events` ids, `x` centered on `center`, charge
/// alternating sign every third event, unit-ish weights
#[allow(clippy::cast_precision_loss)]
fn write_source(root: &Path, name: &str, events: &[u64], center: f64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = events.len();
    let primary = RecordBatch::try_new(
        Arc::new(Schema::new(vec![
            Field::new("event", DataType::UInt64, false),
            Field::new("x", DataType::Float64, false),
            Field::new("q", DataType::Int32, false),
            Field::new("w", DataType::Float64, false),
        ])),
        vec![
            Arc::new(UInt64Array::from(events.to_vec())),
            Arc::new(Float64Array::from_iter_values(
                (0..n).map(|_| center + rng.gen_range(-1.0..1.0)),
            )),
            Arc::new(Int32Array::from_iter_values(
                (0..n).map(|i| if i % 3 == 0 { 1 } else { -1 }),
            )),
            Arc::new(Float64Array::from_iter_values((0..n).map(|i| 0.5 + (i % 2) as f64))),
        ],
    )
    .unwrap();
    write_parquet(
        &root.join("ntuples").join(name).join("mt_nominal.parquet"),
        &primary,
    );

    // Friend rows in reverse order to exercise the keyed join
    let reversed: Vec<u64> = events.iter().rev().copied().collect();
    let friend = RecordBatch::try_new(
        Arc::new(Schema::new(vec![
            Field::new("event", DataType::UInt64, false),
            Field::new("z", DataType::Float64, false),
        ])),
        vec![
            Arc::new(UInt64Array::from(reversed.clone())),
            Arc::new(Float64Array::from_iter_values(
                reversed.iter().map(|&e| (e % 7) as f64),
            )),
        ],
    )
    .unwrap();
    write_parquet(
        &root.join("friends").join(name).join("mt_nominal.parquet"),
        &friend,
    );
}

struct Fixture {
    _dir: TempDir,
    config: PipelineConfig,
    workdir: Workdir,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write_source(root, "Signal", &(0..120).collect::<Vec<_>>(), 1.5, 1);
    write_source(root, "Background", &(1000..1150).collect::<Vec<_>>(), -1.5, 2);
    fs::create_dir_all(root.join("work")).unwrap();

    let json = format!(
        r#"{{
            "ntuples_base": "{ntuples}",
            "friends_base": ["{friends}"],
            "variables": ["x", "z"],
            "classes": ["sig", "bkg"],
            "processes": [
                {{"name": "signal", "class": "sig", "sources": ["Signal"],
                  "selections": [
                      {{"name": "mt", "cuts": [{{"name": "os", "expression": "q<0"}}]}},
                      {{"name": "mc", "weights": [{{"name": "w", "expression": "w"}}]}}
                  ]}},
                {{"name": "background", "class": "bkg", "sources": ["Background"],
                  "selections": [
                      {{"name": "mt", "cuts": [{{"name": "os", "expression": "q<0"}}]}}
                  ]}}
            ],
            "variants": ["mt_nominal", "mt_jecUp"],
            "apply_sources": ["Signal", "Background"],
            "nthreads": 2,
            "training": {{
                "batch_size": 16, "patience": 2, "tolerance": 0.01,
                "hidden_width": 8, "learning_rate": 0.01, "max_steps": 400
            }}
        }}"#,
        ntuples = root.join("ntuples").display(),
        friends = root.join("friends").display(),
    );
    let config_path = root.join("config.json");
    fs::write(&config_path, json).unwrap();

    Fixture {
        config: PipelineConfig::from_json_file(&config_path).unwrap(),
        workdir: Workdir::new(root.join("work")),
        _dir: dir,
    }
}

#[test]
fn test_collect_writes_fold_partitioned_samples() {
    let f = fixture();
    let pool = ScanPool::new(f.config.nthreads).unwrap();
    let summary = collect_samples(&f.config, &f.workdir, &pool).unwrap();

    // q<0 keeps i % 3 != 0: 80 of 120 signal and 100 of 150 background events
    let sig: usize = Fold::ALL
        .iter()
        .map(|&fold| summary[&("sig".to_string(), fold)])
        .sum();
    let bkg: usize = Fold::ALL
        .iter()
        .map(|&fold| summary[&("bkg".to_string(), fold)])
        .sum();
    assert_eq!(sig, 80);
    assert_eq!(bkg, 100);

    for fold in Fold::ALL {
        let path = f
            .workdir
            .existing_artifact(&Artifact::Sample("sig".to_string()), fold)
            .unwrap();
        let batch = StorageEngine::load_parquet(&path).unwrap().concat().unwrap();
        let names: Vec<String> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, vec!["x", "z", "training_weight"]);
        // Signal weights come from `w`, background ones default to 1
        let weights = column_f64(&batch, "training_weight").unwrap();
        assert!(weights.iter().all(|&w| (w - 0.5).abs() < 1e-6 || (w - 1.5).abs() < 1e-6));
    }

    let sample = TrainingSample::load(
        &f.workdir,
        Fold::Zero,
        &f.config.classes,
        &f.config.variables,
        &f.config.weight_column,
        true,
    )
    .unwrap();
    let raw_total = TrainingSample::load(
        &f.workdir,
        Fold::Zero,
        &f.config.classes,
        &f.config.variables,
        &f.config.weight_column,
        false,
    )
    .unwrap()
    .total_weight();
    for label in 0..2 {
        let class = sample.class_weight(label);
        assert!((class - raw_total).abs() / raw_total < 1e-4);
    }
}

#[test]
fn test_full_pipeline() {
    let f = fixture();
    let pool = ScanPool::new(2).unwrap();
    collect_samples(&f.config, &f.workdir, &pool).unwrap();

    for fold in Fold::ALL {
        let outcome = train_fold(&f.config, &f.workdir, fold).unwrap();
        assert!(matches!(
            outcome.status,
            RunStatus::Converged | RunStatus::StepLimit
        ));
        assert!(outcome.best_val_loss.is_finite());

        let log =
            TrainingLog::load(&f.workdir.artifact(&Artifact::TrainingLog, fold)).unwrap();
        assert_eq!(log.run().fold(), fold);
        assert!(!log.is_empty());
        assert!(f.workdir.artifact(&Artifact::Scaler, fold).exists());
        assert!(f.workdir.artifact(&Artifact::Model, fold).exists());
    }

    let summary = inference::apply(&f.config, &f.workdir).unwrap();
    assert_eq!(summary.written.len(), 2);
    assert_eq!(
        summary.skipped,
        vec![
            ("Signal".to_string(), "mt_jecUp".to_string()),
            ("Background".to_string(), "mt_jecUp".to_string()),
        ]
    );

    let scores = f.workdir.scores_dir("Signal").join("mt_nominal.parquet");
    let batch = StorageEngine::load_parquet(&scores).unwrap().concat().unwrap();
    // Every event scored, in source order, including those failing the cut
    assert_eq!(batch.num_rows(), 120);
    assert_eq!(
        column_u64(&batch, EVENT_COLUMN).unwrap(),
        (0..120).collect::<Vec<u64>>()
    );
    let score = column_f64(&batch, SCORE_COLUMN).unwrap();
    let index = column_f64(&batch, INDEX_COLUMN).unwrap();
    assert!(score.iter().all(|&s| (0.5..=1.0).contains(&s)));
    assert!(index.iter().all(|&i| i == 0.0 || i == 1.0));
    assert!(!f.workdir.scores_dir("Signal").join("mt_jecUp.parquet").exists());

    // Output directory conflicts are ignored on a second pass
    inference::apply(&f.config, &f.workdir).unwrap();
}

#[test]
fn test_apply_without_models_is_fatal() {
    let f = fixture();
    let err = inference::apply(&f.config, &f.workdir).unwrap_err();
    assert!(matches!(err, Error::MissingInput(_)));
}

#[test]
fn test_missing_source_directory_is_fatal() {
    let mut f = fixture();
    let pool = ScanPool::new(1).unwrap();
    collect_samples(&f.config, &f.workdir, &pool).unwrap();
    for fold in Fold::ALL {
        train_fold(&f.config, &f.workdir, fold).unwrap();
    }

    f.config.apply_sources.push("DoesNotExist".to_string());
    let err = inference::apply(&f.config, &f.workdir).unwrap_err();
    assert!(matches!(err, Error::MissingInput(_)));
}

#[test]
fn test_collect_missing_source_leaves_no_samples() {
    let mut f = fixture();
    f.config.processes[1].sources.push("DoesNotExist".to_string());
    let pool = ScanPool::new(1).unwrap();
    let err = collect_samples(&f.config, &f.workdir, &pool).unwrap_err();
    assert!(matches!(err, Error::MissingInput(_)));

    for fold in Fold::ALL {
        for class in &f.config.classes {
            assert!(!f
                .workdir
                .artifact(&Artifact::Sample(class.clone()), fold)
                .exists());
        }
    }
}

#[test]
fn test_failed_collect_finalizes_no_sample() {
    let f = fixture();
    let pool = ScanPool::new(1).unwrap();
    collect_samples(&f.config, &f.workdir, &pool).unwrap();

    // Block the last sample written: renaming onto a directory fails
    let blocked = f
        .workdir
        .artifact(&Artifact::Sample("sig".to_string()), Fold::One);
    let mut staging = blocked.clone().into_os_string();
    staging.push(".tmp");
    fs::create_dir(&staging).unwrap();

    assert!(collect_samples(&f.config, &f.workdir, &pool).is_err());
    for fold in Fold::ALL {
        for class in &f.config.classes {
            let path = f.workdir.artifact(&Artifact::Sample(class.clone()), fold);
            assert!(!path.exists(), "{} left behind", path.display());
        }
    }
    let leftovers: Vec<_> = fs::read_dir(f.workdir.root())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");

    // Collection succeeds again once the obstruction is gone
    fs::remove_dir(&staging).unwrap();
    collect_samples(&f.config, &f.workdir, &pool).unwrap();
    assert!(blocked.exists());
}

#[test]
fn test_train_without_samples_is_fatal() {
    let f = fixture();
    let err = train_fold(&f.config, &f.workdir, Fold::Zero).unwrap_err();
    assert!(matches!(err, Error::MissingInput(_)));
}
