//! midend-opt: runs the mid-end passes over a textual module.
//!
//! Reads a module from a file (or stdin), runs the configured passes and
//! prints the transformed module followed by the tensor allocation map.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;

use bumpalo::Bump;
use clap::Parser;

use hlo_midend::core::{MidendConfig, PassResult, PassSession};
use hlo_midend::passes::default_pipeline;
use hlo_midend::text::{parse_module, print_allocation_map, print_module};

/// Run the HLO mid-end over a textual module
#[derive(Parser, Debug)]
#[command(name = "midend-opt")]
#[command(version, about = "Run the HLO mid-end passes over a textual module", long_about = None)]
struct Cli {
    /// Input module; stdin when omitted
    #[arg(value_name = "INPUT")]
    input: Option<PathBuf>,

    /// Matcher look-through depth (0 disables)
    #[arg(long)]
    look_through_depth: Option<usize>,

    /// Reject matches whose instructions disagree on sharding
    #[arg(long)]
    unique_sharding: bool,

    /// Only match inside the entry computation
    #[arg(long)]
    root_computation_only: bool,

    /// Iteration cap of every fixed-point wrapper
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Pass to skip; may be repeated
    #[arg(long = "disable", value_name = "PASS")]
    disable: Vec<String>,

    /// Parse and print only, running no pass
    #[arg(long)]
    parse_only: bool,

    /// Print session statistics to stderr
    #[arg(long)]
    stats: bool,
}

impl Cli {
    /// Environment configuration with the command line layered on top.
    fn config(&self) -> PassResult<MidendConfig> {
        let mut config = MidendConfig::from_env()?;
        if let Some(depth) = self.look_through_depth {
            config.look_through_max_depth = depth;
        }
        if self.unique_sharding {
            config.requires_unique_sharding = true;
        }
        if self.root_computation_only {
            config.root_computation_only = true;
        }
        if let Some(iterations) = self.max_iterations {
            config.max_fixed_point_iterations = iterations.max(1);
        }
        for pass in &self.disable {
            config.disable_pass(pass)?;
        }
        Ok(config)
    }
}

fn read_input(input: Option<&PathBuf>) -> io::Result<String> {
    match input {
        Some(path) => fs::read_to_string(path),
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            Ok(buffer)
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let text = read_input(cli.input.as_ref())?;
    let mut module = parse_module(&text)?;
    if cli.parse_only {
        print!("{}", print_module(&module));
        return Ok(());
    }

    let config = cli.config()?;
    log::debug!("{:?}", config);

    let arena = Bump::new();
    let session = PassSession::new(&arena);
    let mut pipeline = default_pipeline(&config)?;
    log::info!("Pipeline: {}", pipeline.pass_names().join(", "));
    pipeline.run(&mut module, &session)?;

    print!("{}", print_module(&module));
    let annotations = session.annotations();
    if !annotations.tensor_allocation_map.is_empty() {
        println!();
        println!("; tensor allocation map");
        print!("{}", print_allocation_map(&module, &annotations.tensor_allocation_map));
    }
    if cli.stats {
        eprint!("{}", session.stats());
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
