//! DSP benchmark: times segmentation, pitch estimation and scoring over WAV
//! fixtures (or a synthetic signal when no fixtures are given) and prints a
//! JSON summary.
//!
//! ```text
//! benchmark [--fixtures-dir DIR] [--iterations N] [--output FILE]
//! ```

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use timbre_core::{
    pitch::PitchEstimator,
    score::{Candidate, QualityScorer},
    segment::{Segmenter, SegmenterConfig},
    Waveform,
};

const ANALYSIS_RATE: u32 = 22_050;

#[derive(Debug)]
struct Args {
    fixtures_dir: Option<PathBuf>,
    iterations: usize,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
struct CaseResult {
    file: String,
    duration_ms: u64,
    segments: usize,
    median_hz: Option<f32>,
    segment_ms: f64,
    pitch_ms: f64,
    score_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
struct StageSummary {
    stage: &'static str,
    runs: usize,
    p50_ms: f64,
    p95_ms: f64,
    avg_ms: f64,
}

#[derive(Debug, Serialize)]
struct Summary {
    iterations: usize,
    cases: Vec<CaseResult>,
    stages: Vec<StageSummary>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let inputs = load_inputs(args.fixtures_dir.as_deref())?;

    let segmenter = Segmenter::new(SegmenterConfig::default());
    let estimator = PitchEstimator::new(ANALYSIS_RATE);
    let scorer = QualityScorer::new(ANALYSIS_RATE);

    let mut cases = Vec::new();
    for (name, waveform) in &inputs {
        for _ in 0..args.iterations {
            let t = Instant::now();
            let segments = segmenter.split(waveform);
            let segment_ms = ms(t);

            let t = Instant::now();
            let estimate = estimator.estimate(waveform).map_err(|e| e.to_string())?;
            let pitch_ms = ms(t);

            let t = Instant::now();
            scorer
                .score(waveform, &[Candidate::new(Some(name.clone()), waveform.clone())])
                .map_err(|e| e.to_string())?;
            let score_ms = ms(t);

            cases.push(CaseResult {
                file: name.clone(),
                duration_ms: waveform.duration_ms(),
                segments: segments.len(),
                median_hz: estimate.hz(),
                segment_ms,
                pitch_ms,
                score_ms,
            });
        }
    }

    let stages = vec![
        summarize("segment", cases.iter().map(|c| c.segment_ms).collect()),
        summarize("pitch", cases.iter().map(|c| c.pitch_ms).collect()),
        summarize("score", cases.iter().map(|c| c.score_ms).collect()),
    ];
    let summary = Summary {
        iterations: args.iterations,
        cases,
        stages,
    };

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    match &args.output {
        Some(path) => std::fs::write(path, json).map_err(|e| format!("{}: {e}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        fixtures_dir: None,
        iterations: 3,
        output: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        let mut value = || it.next().ok_or_else(|| format!("{flag} needs a value"));
        match flag.as_str() {
            "--fixtures-dir" => args.fixtures_dir = Some(PathBuf::from(value()?)),
            "--iterations" => {
                args.iterations = value()?
                    .parse()
                    .map_err(|e| format!("--iterations: {e}"))?
            }
            "--output" => args.output = Some(PathBuf::from(value()?)),
            other => return Err(format!("unknown argument {other}")),
        }
    }
    args.iterations = args.iterations.max(1);
    Ok(args)
}

fn load_inputs(dir: Option<&Path>) -> Result<Vec<(String, Waveform)>, String> {
    let Some(dir) = dir else {
        return Ok(vec![("synthetic".into(), synthetic())]);
    };
    let mut out = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| format!("{}: {e}", dir.display()))?;
    for entry in entries {
        let path = entry.map_err(|e| e.to_string())?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("wav") {
            continue;
        }
        let bytes = std::fs::read(&path).map_err(|e| format!("{}: {e}", path.display()))?;
        let waveform = Waveform::from_wav_bytes(&bytes).map_err(|e| format!("{}: {e}", path.display()))?;
        out.push((path.display().to_string(), waveform));
    }
    if out.is_empty() {
        return Err(format!("no .wav fixtures in {}", dir.display()));
    }
    Ok(out)
}

/// Ten seconds of a 220 Hz tone broken by two seconds of silence.
fn synthetic() -> Waveform {
    let rate = ANALYSIS_RATE as usize;
    let samples = (0..rate * 10)
        .map(|i| {
            let t = i as f32 / rate as f32;
            if (4.0..6.0).contains(&t) {
                0.0
            } else {
                0.5 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
            }
        })
        .collect();
    Waveform::new(samples, ANALYSIS_RATE)
}

fn ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1_000.0
}

fn summarize(stage: &'static str, mut values: Vec<f64>) -> StageSummary {
    values.sort_by(f64::total_cmp);
    let pick = |q: f64| {
        if values.is_empty() {
            0.0
        } else {
            values[((values.len() - 1) as f64 * q).round() as usize]
        }
    };
    StageSummary {
        stage,
        runs: values.len(),
        p50_ms: pick(0.5),
        p95_ms: pick(0.95),
        avg_ms: values.iter().sum::<f64>() / values.len().max(1) as f64,
    }
}
