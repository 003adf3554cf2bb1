use std::{env, fs, process::ExitCode, time::Instant};

use throwline::scenario::{Outcome, Scenario};

const USAGE: &str = "usage: throwline <scenario.json> [--no-abort]";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let no_abort = args.iter().any(|arg| arg == "--no-abort");
    let Some(file_path) = args.iter().find(|arg| !arg.starts_with("--")) else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };
    let json = match read_file(file_path) {
        Ok(json) => json,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let scenario = match Scenario::from_json(&json) {
        Ok(scenario) => scenario,
        Err(err) => {
            eprintln!("error:\n{err}");
            return ExitCode::FAILURE;
        }
    };

    let start = Instant::now();
    let report = match scenario.run() {
        Ok(report) => report,
        Err(err) => {
            let elapsed = start.elapsed();
            eprintln!("error after: {elapsed:?}\n{err}");
            return ExitCode::FAILURE;
        }
    };
    let elapsed = start.elapsed();

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            eprintln!("error serializing report: {err}");
            return ExitCode::FAILURE;
        }
    }
    for line in &report.diagnostics {
        eprintln!("{line}");
    }

    match report.outcome {
        Outcome::Fatal { .. } if no_abort => {
            eprintln!("fatal after: {elapsed:?}");
            ExitCode::FAILURE
        }
        // the engine's contract: nothing runs after a fatal dispatch
        Outcome::Fatal { .. } => std::process::abort(),
        Outcome::Resumed { .. } | Outcome::ThreadTerminated { .. } => {
            eprintln!("success after: {elapsed:?}");
            ExitCode::SUCCESS
        }
    }
}

fn read_file(file_path: &str) -> Result<String, String> {
    eprintln!("Reading file: {file_path}");
    match fs::metadata(file_path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("{file_path} is not a file"));
            }
        }
        Err(err) => {
            return Err(format!("reading {file_path}: {err}"));
        }
    }
    fs::read_to_string(file_path).map_err(|err| format!("reading file: {err}"))
}
