use clap::{Parser, Subcommand, ValueEnum};

use kubevip_kubernetes::{config::Config, controller::server};
use kubevip_trace::init::TraceConfig;

use crate::controller::ControllerCmd;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cmd {
    #[arg(
        short,
        long,
        global = true,
        required = false,
        default_value = "info",
        help = "Log level(trace, debug, info, warn, error)"
    )]
    pub level: String,

    #[arg(
        value_enum,
        short = 'd',
        long,
        global = true,
        required = false,
        default_value = "plain",
        help = "Log display format"
    )]
    pub format: Format,

    #[arg(short = 'o', long = "log-file", help = "Log output file path")]
    pub log_file: Option<String>,

    #[clap(subcommand)]
    pub sub: SubCmd,
}

#[derive(Debug, Clone, Parser, ValueEnum)]
pub enum Format {
    Plain,
    Json,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Plain => write!(f, "plain"),
            Format::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum SubCmd {
    Controller(ControllerCmd),
    Version,
}

pub fn run() {
    let command = Cmd::parse();

    let format = command.format;
    let level = command.level;
    let log_file = command.log_file;

    match command.sub {
        SubCmd::Version => println!("dev"),
        SubCmd::Controller(c) => {
            let trace_conf = TraceConfig {
                level,
                format: format.to_string(),
                file: log_file,
            };

            let mut config = match c.file {
                None => Config::from_env().unwrap(),
                Some(file) => Config::load(&file).unwrap(),
            };

            if let Some(port) = c.http_port {
                config.http_port = port;
            }
            if let Some(ns) = c.namespace {
                config.namespace = ns;
            }
            if let Some(cm) = c.config_map {
                config.config_map = cm;
            }
            if let Some(class) = c.load_balancer_class {
                config.load_balancer_class = class;
                config.enable_load_balancer_class = true;
            }

            server::start(config, trace_conf);
        }
    }
}
