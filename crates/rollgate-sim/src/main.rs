use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rollgate_core::telemetry::{init_tracing_with_default, LogFormat};
use rollgate_sim::{run_sanity, run_simulation, SanityConfig, SimulatorConfig};

fn cli() -> Command {
    Command::new("rollgate-sim")
        .version(rollgate_core::VERSION)
        .about("Seeded simulator for the Rollgate coordination pipeline")
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("text")
                .value_parser(value_parser!(LogFormat))
                .help("Log output: text or json"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a multi-agent simulation and check pipeline invariants")
                .arg(
                    Arg::new("proposals")
                        .long("proposals")
                        .default_value("200")
                        .value_parser(value_parser!(usize))
                        .help("Number of proposals to submit"),
                )
                .arg(
                    Arg::new("agents")
                        .long("agents")
                        .default_value("6")
                        .value_parser(value_parser!(usize))
                        .help("Number of submitting agents"),
                )
                .arg(
                    Arg::new("resources")
                        .long("resources")
                        .default_value("12")
                        .value_parser(value_parser!(usize))
                        .help("Size of the shared resource pool"),
                )
                .arg(
                    Arg::new("unhealthy-rate")
                        .long("unhealthy-rate")
                        .default_value("0.05")
                        .value_parser(value_parser!(f64))
                        .help("Probability that one health check fails"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output the report as JSON"),
                ),
        )
        .subcommand(
            Command::new("sanity")
                .about("Measure the comparator's false-positive rate on identical distributions")
                .arg(
                    Arg::new("trials")
                        .long("trials")
                        .default_value("1000")
                        .value_parser(value_parser!(usize))
                        .help("Number of comparisons"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output the report as JSON"),
                ),
        )
}

async fn simulate(args: &ArgMatches) -> anyhow::Result<bool> {
    let config = SimulatorConfig {
        proposals: *args.get_one::<usize>("proposals").unwrap(),
        agents: *args.get_one::<usize>("agents").unwrap(),
        resource_pool: *args.get_one::<usize>("resources").unwrap(),
        unhealthy_rate: *args.get_one::<f64>("unhealthy-rate").unwrap(),
        seed: *args.get_one::<u64>("seed").unwrap(),
        ..SimulatorConfig::default()
    };
    let report = run_simulation(config).await?;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.generate_text());
    }
    Ok(report.passed())
}

fn sanity(args: &ArgMatches) -> anyhow::Result<bool> {
    let config = SanityConfig {
        trials: *args.get_one::<usize>("trials").unwrap(),
        seed: *args.get_one::<u64>("seed").unwrap(),
        ..SanityConfig::default()
    };
    let report = run_sanity(config)?;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.generate_text());
    }
    Ok(report.passed())
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    let format = matches
        .get_one::<LogFormat>("log-format")
        .copied()
        .unwrap_or_default();
    init_tracing_with_default(format, "warn");

    let outcome = match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("sanity", args)) => sanity(args),
        _ => Ok(true),
    };

    match outcome {
        Ok(passed) => std::process::exit(if passed { 0 } else { 1 }),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn simulate_flags_parse() {
        let matches = cli()
            .try_get_matches_from([
                "rollgate-sim",
                "--log-format",
                "json",
                "simulate",
                "--proposals",
                "10",
                "--seed",
                "7",
            ])
            .unwrap();
        assert_eq!(
            matches.get_one::<LogFormat>("log-format"),
            Some(&LogFormat::Json)
        );
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "simulate");
        assert_eq!(args.get_one::<usize>("proposals"), Some(&10));
        assert_eq!(args.get_one::<u64>("seed"), Some(&7));
    }
}
