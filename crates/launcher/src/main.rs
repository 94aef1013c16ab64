use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fleetrun_core::devices::DeviceKind;
use fleetrun_core::env::ProcessEnv;
use fleetrun_core::ps::RoleSpec;
use fleetrun_core::{
    build_topology, launch, DefaultIpResolver, DistributedMode, JobContext, LaunchConfig,
    LaunchError, OsSpawner, SystemClock,
};

use fleetrun::config::FileConfig;
use fleetrun::logging;
use fleetrun::shutdown::install_interrupt_flag;

#[derive(Parser)]
#[command(name = "fleetrun", version, about = "Launch and supervise distributed training jobs")]
struct Cli {
    /// Log filter (trace, debug, info, warn, error or a RUST_LOG directive).
    /// Overrides RUST_LOG and the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start this node's processes of a training job and supervise them
    Launch {
        #[command(flatten)]
        job: JobArgs,

        /// Training script to run in every process
        training_script: String,

        /// Arguments passed through to the training script
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        training_script_args: Vec<String>,
    },
    /// Print the cluster this node would launch as JSON without spawning anything
    Topology {
        #[command(flatten)]
        job: JobArgs,
    },
    /// Show the persisted defaults, or update them with --save
    Config {
        #[command(flatten)]
        job: JobArgs,

        /// Write the given options into the config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct JobArgs {
    /// collective, ps, ps_heter or ps_gpu; inferred from the other options when unset
    #[arg(long, alias = "distributed_mode")]
    distributed_mode: Option<DistributedMode>,

    /// Directory for workerlog.N, serverlog.N and heterlog.N
    #[arg(long, alias = "log_dir")]
    log_dir: Option<PathBuf>,

    /// Program that runs the training script, e.g. "python3 -u"
    #[arg(long)]
    interpreter: Option<String>,

    // ─── Collective ─────────────────────────────────────────────────────
    /// Comma-separated IPs of every node in the job
    #[arg(long)]
    ips: Option<String>,

    /// Comma-separated device ids to use on this node
    #[arg(long, alias = "selected_gpus")]
    gpus: Option<String>,

    /// First port of deterministically allocated endpoints
    #[arg(long, env = "FLAGS_START_PORT")]
    start_port: Option<u16>,

    /// This node's IP, when it cannot be found from the network interfaces
    #[arg(long)]
    node_ip: Option<String>,

    // ─── Parameter server ───────────────────────────────────────────────
    /// Comma-separated server endpoints
    #[arg(long)]
    servers: Option<String>,

    /// Number of servers on this machine
    #[arg(long, alias = "server_num")]
    server_num: Option<usize>,

    /// Comma-separated worker endpoints
    #[arg(long)]
    workers: Option<String>,

    /// Number of workers on this machine
    #[arg(long, alias = "worker_num")]
    worker_num: Option<usize>,

    /// Comma-separated heterogeneous worker endpoints
    #[arg(long, alias = "heter_workers")]
    heter_workers: Option<String>,

    /// Number of heterogeneous workers on this machine
    #[arg(long, alias = "heter_worker_num")]
    heter_worker_num: Option<usize>,

    /// Accelerator of heterogeneous workers: gpu or xpu
    #[arg(long, alias = "heter_worker_device")]
    heter_worker_device: Option<DeviceKind>,
}

impl JobArgs {
    /// The options that can also come from the config file.
    fn as_file_config(&self, log_level: Option<&str>) -> FileConfig {
        FileConfig {
            log_level: log_level.map(String::from),
            distributed_mode: self.distributed_mode,
            log_dir: self.log_dir.clone(),
            interpreter: self.interpreter.clone(),
            start_port: self.start_port,
            ips: self.ips.clone(),
            gpus: self.gpus.clone(),
            heter_worker_device: self.heter_worker_device,
        }
    }

    fn launch_config(
        &self,
        defaults: &FileConfig,
        training_script: String,
        training_script_args: Vec<String>,
    ) -> LaunchConfig {
        let mut config = LaunchConfig::new(training_script);
        config.training_script_args = training_script_args;
        defaults.apply_to(&mut config);
        config.node_ip = self.node_ip.clone();
        config.servers = RoleSpec {
            count: self.server_num,
            endpoints: self.servers.clone(),
        };
        config.workers = RoleSpec {
            count: self.worker_num,
            endpoints: self.workers.clone(),
        };
        config.heter_workers = RoleSpec {
            count: self.heter_worker_num,
            endpoints: self.heter_workers.clone(),
        };
        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let file_config = match FileConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Ignoring config file: {e}");
            FileConfig::default()
        }
    };

    let level = cli
        .log_level
        .as_deref()
        .or(file_config.log_level.as_deref());
    if let Err(e) = logging::init_with_level(level) {
        eprintln!("{e}");
    }

    match run(cli, file_config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<LaunchError>()
                .map_or(1, LaunchError::exit_code);
            tracing::error!("{e:#}");
            report_failure(&e);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(cli: Cli, mut defaults: FileConfig) -> anyhow::Result<()> {
    match cli.command {
        Command::Launch {
            job,
            training_script,
            training_script_args,
        } => {
            defaults.merge(&job.as_file_config(None));
            let config = job.launch_config(&defaults, training_script, training_script_args);
            run_job(&config)
        }
        Command::Topology { job } => {
            defaults.merge(&job.as_file_config(None));
            let config = job.launch_config(&defaults, String::new(), Vec::new());
            let (cluster, pod_index) = build_topology(&config, &ProcessEnv, &DefaultIpResolver)?;
            let json = serde_json::json!({ "pod_index": pod_index, "cluster": cluster });
            println!("{}", serde_json::to_string_pretty(&json)?);
            Ok(())
        }
        Command::Config { job, save } => {
            defaults.merge(&job.as_file_config(cli.log_level.as_deref()));
            if save {
                let path = defaults.save().context("failed to save config file")?;
                println!("Saved config to: {}", path.display());
            } else {
                if let Some(path) = FileConfig::default_path() {
                    println!("# {}", path.display());
                }
                print!("{}", toml::to_string_pretty(&defaults)?);
            }
            Ok(())
        }
    }
}

fn run_job(config: &LaunchConfig) -> anyhow::Result<()> {
    let interrupted = install_interrupt_flag().context("failed to install signal handler")?;

    let spawner = OsSpawner;
    let clock = SystemClock;
    let resolver = DefaultIpResolver;
    let vars = ProcessEnv;
    let mut stdout = io::stdout();

    let mut ctx = JobContext::new(&spawner, &clock, &resolver, &vars, &mut stdout);
    ctx.base_env = std::env::vars().collect();
    ctx.interrupted = Some(&interrupted);

    tracing::info!(cmd = %config.command(), "starting job");
    launch(config, &mut ctx)?;
    tracing::info!("job finished");
    Ok(())
}

fn report_failure(err: &anyhow::Error) {
    match err.downcast_ref::<LaunchError>() {
        Some(LaunchError::RoleProcessFailure { failed, nranks }) => {
            eprintln!("fleetrun: job of {nranks} trainers failed");
            for process in failed {
                eprintln!("fleetrun:   {process}");
            }
        }
        Some(LaunchError::Interrupted) => eprintln!("fleetrun: job interrupted"),
        _ => eprintln!("fleetrun: {err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_launch_with_script_args() {
        let cli = Cli::try_parse_from([
            "fleetrun",
            "launch",
            "--gpus",
            "0,1",
            "--start-port",
            "7000",
            "train.py",
            "--lr",
            "0.1",
        ])
        .unwrap();

        let Command::Launch {
            job,
            training_script,
            training_script_args,
        } = cli.command
        else {
            panic!("expected launch");
        };
        assert_eq!(job.gpus.as_deref(), Some("0,1"));
        assert_eq!(job.start_port, Some(7000));
        assert_eq!(training_script, "train.py");
        assert_eq!(training_script_args, vec!["--lr", "0.1"]);
    }

    #[test]
    fn cli_accepts_underscore_aliases() {
        let cli = Cli::try_parse_from([
            "fleetrun",
            "topology",
            "--server_num",
            "2",
            "--worker_num",
            "3",
            "--distributed_mode",
            "ps",
        ])
        .unwrap();

        let Command::Topology { job } = cli.command else {
            panic!("expected topology");
        };
        assert_eq!(job.server_num, Some(2));
        assert_eq!(job.worker_num, Some(3));
        assert_eq!(job.distributed_mode, Some(DistributedMode::Ps));
    }

    #[test]
    fn cli_flags_override_file_defaults() {
        let mut defaults = FileConfig {
            interpreter: Some("python3 -u".into()),
            start_port: Some(6000),
            ..Default::default()
        };
        let job = JobArgs {
            start_port: Some(7000),
            worker_num: Some(2),
            ..Default::default()
        };

        defaults.merge(&job.as_file_config(None));
        let config = job.launch_config(&defaults, "train.py".into(), Vec::new());

        assert_eq!(config.interpreter.as_deref(), Some("python3 -u"));
        assert_eq!(config.start_port, Some(7000));
        assert_eq!(config.workers, RoleSpec::count(2));
        assert_eq!(config.command().to_string(), "python3 -u train.py");
    }
}
