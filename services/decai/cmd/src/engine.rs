//! Proof engine backed by an external prover executable.
//!
//! Each operation runs `<program> [args..] <subcommand> --flag path ...` in a
//! scratch directory. Inputs are written to files there and the output file
//! named by the command line is read back:
//!
//! | subcommand    | inputs                                | output       |
//! |---------------|---------------------------------------|--------------|
//! | `gen-witness` | `--compiled-circuit`, `--data`        | `--output`   |
//! | `gen-vk`      | `--compiled-circuit`, `--srs-path`    | `--vk-path`  |
//! | `gen-pk`      | `--vk-path`, `--compiled-circuit`, `--srs-path` | `--pk-path` |
//! | `prove`       | `--witness`, `--pk-path`, `--compiled-circuit`, `--srs-path` | `--proof-path` |
//! | `verify`      | `--proof-path`, `--vk-path`, `--settings-path`, `--srs-path` | exit status |
//!
//! `verify` exits 0 for a valid proof and 1 for an invalid one. Output
//! decoding happens in-process from the witness JSON.

use bytes::Bytes;
use decai_inference::{InferenceError, ProofEngine};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;
use tracing::debug;

use crate::config::EngineConfig;

/// Runs the configured prover for every engine call
#[derive(Debug, Clone)]
pub struct CliProofEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl CliProofEngine {
    /// Engine for `config`
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    fn run(&self, subcommand: &str, flags: &[(&str, &Path)]) -> Result<Output, InferenceError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(subcommand);
        for (flag, path) in flags {
            command.arg(flag).arg(path);
        }

        debug!("Running {:?} {}", self.program, subcommand);
        command.output().map_err(|e| {
            InferenceError::Engine(format!(
                "failed to start {:?} {}: {}",
                self.program, subcommand, e
            ))
        })
    }

    fn run_checked(&self, subcommand: &str, flags: &[(&str, &Path)]) -> Result<(), InferenceError> {
        let output = self.run(subcommand, flags)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(failure(subcommand, &output))
        }
    }
}

/// Scratch directory holding one operation's files
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Result<Self, InferenceError> {
        let dir = tempfile::Builder::new().prefix("decai-prover-").tempdir()?;
        Ok(Self { dir })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn put(&self, name: &str, contents: &[u8]) -> Result<PathBuf, InferenceError> {
        let path = self.path(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    fn take(&self, subcommand: &str, path: &Path) -> Result<Bytes, InferenceError> {
        std::fs::read(path).map(Bytes::from).map_err(|e| {
            InferenceError::Engine(format!(
                "{} produced no {}: {}",
                subcommand,
                path.file_name().and_then(|n| n.to_str()).unwrap_or("output"),
                e
            ))
        })
    }
}

fn failure(subcommand: &str, output: &Output) -> InferenceError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    InferenceError::Engine(format!(
        "{} failed ({}): {}",
        subcommand,
        output.status,
        stderr.trim()
    ))
}

impl ProofEngine for CliProofEngine {
    fn gen_witness(&self, compiled: &[u8], input: &[u8]) -> Result<Bytes, InferenceError> {
        let ws = Workspace::new()?;
        let compiled = ws.put("network.compiled", compiled)?;
        let data = ws.put("input.json", input)?;
        let witness = ws.path("witness.json");

        self.run_checked(
            "gen-witness",
            &[
                ("--compiled-circuit", &compiled),
                ("--data", &data),
                ("--output", &witness),
            ],
        )?;
        ws.take("gen-witness", &witness)
    }

    fn gen_vk(&self, compiled: &[u8], srs: &[u8]) -> Result<Bytes, InferenceError> {
        let ws = Workspace::new()?;
        let compiled = ws.put("network.compiled", compiled)?;
        let srs = ws.put("kzg.srs", srs)?;
        let vk = ws.path("vk.key");

        self.run_checked(
            "gen-vk",
            &[
                ("--compiled-circuit", &compiled),
                ("--srs-path", &srs),
                ("--vk-path", &vk),
            ],
        )?;
        ws.take("gen-vk", &vk)
    }

    fn gen_pk(&self, vk: &[u8], compiled: &[u8], srs: &[u8]) -> Result<Bytes, InferenceError> {
        let ws = Workspace::new()?;
        let vk = ws.put("vk.key", vk)?;
        let compiled = ws.put("network.compiled", compiled)?;
        let srs = ws.put("kzg.srs", srs)?;
        let pk = ws.path("pk.key");

        self.run_checked(
            "gen-pk",
            &[
                ("--vk-path", &vk),
                ("--compiled-circuit", &compiled),
                ("--srs-path", &srs),
                ("--pk-path", &pk),
            ],
        )?;
        ws.take("gen-pk", &pk)
    }

    fn prove(
        &self,
        witness: &[u8],
        pk: &[u8],
        compiled: &[u8],
        srs: &[u8],
    ) -> Result<Bytes, InferenceError> {
        let ws = Workspace::new()?;
        let witness = ws.put("witness.json", witness)?;
        let pk = ws.put("pk.key", pk)?;
        let compiled = ws.put("network.compiled", compiled)?;
        let srs = ws.put("kzg.srs", srs)?;
        let proof = ws.path("proof.json");

        self.run_checked(
            "prove",
            &[
                ("--witness", &witness),
                ("--pk-path", &pk),
                ("--compiled-circuit", &compiled),
                ("--srs-path", &srs),
                ("--proof-path", &proof),
            ],
        )?;
        ws.take("prove", &proof)
    }

    fn verify(
        &self,
        proof: &[u8],
        vk: &[u8],
        settings: &[u8],
        srs: &[u8],
    ) -> Result<bool, InferenceError> {
        let ws = Workspace::new()?;
        let proof = ws.put("proof.json", proof)?;
        let vk = ws.put("vk.key", vk)?;
        let settings = ws.put("settings.json", settings)?;
        let srs = ws.put("kzg.srs", srs)?;

        let output = self.run(
            "verify",
            &[
                ("--proof-path", &proof),
                ("--vk-path", &vk),
                ("--settings-path", &settings),
                ("--srs-path", &srs),
            ],
        )?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(failure("verify", &output)),
        }
    }

    fn decode_outputs(
        &self,
        witness: &[u8],
        settings: &[u8],
    ) -> Result<Vec<Vec<f64>>, InferenceError> {
        decode_witness_outputs(witness, settings)
    }
}

#[derive(Debug, Deserialize)]
struct WitnessFile {
    #[serde(default)]
    outputs: Vec<Vec<FixedPoint>>,
    #[serde(default)]
    pretty_elements: Option<PrettyElements>,
}

#[derive(Debug, Deserialize)]
struct PrettyElements {
    #[serde(default)]
    rescaled_outputs: Vec<Vec<String>>,
}

/// Integer output, written either as a JSON number or a decimal string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixedPoint {
    Number(i64),
    Text(String),
}

impl FixedPoint {
    fn value(&self) -> Result<i64, InferenceError> {
        match self {
            FixedPoint::Number(n) => Ok(*n),
            FixedPoint::Text(s) => s
                .parse()
                .map_err(|_| InferenceError::Engine(format!("witness output {:?} is not an integer", s))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CircuitSettings {
    #[serde(default)]
    model_output_scales: Vec<i32>,
}

/// Model outputs from a witness.
///
/// Already rescaled values are used when the witness carries them; otherwise
/// each fixed-point output is divided by `2^scale` using the per-output
/// scales from the settings (the first scale when only one is given).
pub fn decode_witness_outputs(
    witness: &[u8],
    settings: &[u8],
) -> Result<Vec<Vec<f64>>, InferenceError> {
    let witness: WitnessFile = serde_json::from_slice(witness)
        .map_err(|e| InferenceError::Engine(format!("unreadable witness: {}", e)))?;

    if let Some(pretty) = witness.pretty_elements {
        if !pretty.rescaled_outputs.is_empty() {
            return pretty
                .rescaled_outputs
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|v| {
                            v.parse::<f64>().map_err(|_| {
                                InferenceError::Engine(format!("rescaled output {:?} is not a number", v))
                            })
                        })
                        .collect()
                })
                .collect();
        }
    }

    let settings: CircuitSettings = serde_json::from_slice(settings)
        .map_err(|e| InferenceError::Engine(format!("unreadable settings: {}", e)))?;

    witness
        .outputs
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let scale = settings
                .model_output_scales
                .get(i)
                .or_else(|| settings.model_output_scales.first())
                .copied()
                .ok_or_else(|| {
                    InferenceError::Engine("settings carry no model_output_scales".to_string())
                })?;
            let divisor = 2f64.powi(scale);
            row.iter()
                .map(|v| v.value().map(|n| n as f64 / divisor))
                .collect()
        })
        .collect()
}
