// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

use clap::Parser;
use log::{error, LevelFilter};
use macos_fvde::{extract_hashes, ExtractOptions};
use simplelog::{Config, SimpleLogger};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Path to a raw disk image containing a FileVault2 (CoreStorage) volume
    image: PathBuf,
}

fn main() -> ExitCode {
    // Set logging level to warning
    if let Err(err) = SimpleLogger::init(LevelFilter::Warn, Config::default()) {
        eprintln!("Failed to initialize simple logger: {err}");
    }

    let args = Args::parse();
    let file = match File::open(&args.image) {
        Ok(result) => result,
        Err(err) => {
            error!("Failed to open {}: {err}", args.image.display());
            return ExitCode::FAILURE;
        }
    };

    let mut reader = BufReader::new(file);
    let extraction = match extract_hashes(&mut reader, &ExtractOptions::default()) {
        Ok(result) => result,
        Err(err) => {
            error!("Failed to extract hashes from {}: {err}", args.image.display());
            return ExitCode::FAILURE;
        }
    };

    let mut stdout = io::stdout().lock();
    for line in &extraction.lines {
        if let Err(err) = writeln!(stdout, "{line}") {
            error!("Failed to write hash line: {err}");
            return ExitCode::FAILURE;
        }
    }

    for failure in &extraction.failures {
        error!(
            "Boot volume at offset {} with CoreStorage volume at offset {}: {}",
            failure.boot_offset, failure.core_storage_offset, failure.error
        );
    }
    if extraction.failures.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
