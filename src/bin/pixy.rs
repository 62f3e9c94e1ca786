// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use clap::Parser;
use dotenv::dotenv;
use pixy::service::{setup_local_tracing, setup_tracing};
use pixy::{App, AppConfig, AppError, AppResult, ProxyConfig};
use tokio::{runtime, signal};
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "./pixy.yaml";
const DEFAULT_ALIAS: &str = "default";

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// export traces and metrics over OTLP
    #[arg(long)]
    pub otlp: bool,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective config as JSON and exit
    PrintConfig,
    /// validate the config and exit
    CheckConfig,
}

fn load_config(conf: Option<&str>) -> AppResult<AppConfig> {
    match conf {
        Some(path) => AppConfig::set_up_config(path),
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                AppConfig::set_up_config(path)
            } else {
                Ok(AppConfig::with_default_proxy(
                    DEFAULT_ALIAS,
                    ProxyConfig::default(),
                ))
            }
        }
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();

    let level = match commandline.verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    };
    if let Some(level) = level {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", level);
        }
    }

    let config = load_config(commandline.conf.as_deref())?;
    match commandline.command {
        Some(Command::PrintConfig) => {
            let printed = serde_json::to_string_pretty(&config)
                .map_err(|e| AppError::InvalidValue(format!("config: {}", e)))?;
            println!("{}", printed);
            return Ok(());
        }
        Some(Command::CheckConfig) => {
            config.validate()?;
            println!("config ok: {} proxies", config.proxies.len());
            return Ok(());
        }
        None => {}
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _otel_guard = if commandline.otlp {
        Some(rt.block_on(setup_tracing())?)
    } else {
        setup_local_tracing()?;
        None
    };

    rt.block_on(async move {
        let app = App::start_standalone(config)?;
        info!("pixy started, default proxy {}", app.default_alias());
        signal::ctrl_c().await?;
        info!("got shutdown signal");
        app.shutdown().await;
        Ok(())
    })
}
