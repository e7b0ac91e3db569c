//! PaxBoot replica cluster launcher.

use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use paxboot::{
    logger_init, me_init, pf_error, pf_info, Launcher, LauncherConfig,
    PaxbootError, PayloadFormat, PeerPolicy, ProcessSpawner,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(allow_negative_numbers = true)]
struct CliArgs {
    /// Total number of server replicas to launch.
    num_replicas: i64,

    /// Failure-injection rate handed to every replica, within [0, 1].
    fail_rate: Option<f64>,

    /// Launcher configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Peer addresses handed to each replica: exclude_self|include_self.
    /// Overrides `peer_policy` in `--config`.
    #[arg(long)]
    peer_policy: Option<String>,

    /// Replica command line encoding: positional|text_format.
    /// Overrides `payload_format` in `--config`.
    #[arg(long)]
    payload_format: Option<String>,

    /// Print every replica's command line and exit without starting any.
    #[arg(long)]
    dry_run: bool,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok((population, config))` on
    /// success or `Err(PaxbootError)` on any error.
    fn sanitize(&self) -> Result<(u8, LauncherConfig), PaxbootError> {
        if self.num_replicas <= 0 || self.num_replicas > u8::MAX as i64 {
            return Err(PaxbootError::msg(format!(
                "invalid number of replicas {}, must be within [1, {}]",
                self.num_replicas,
                u8::MAX
            )));
        }
        if let Some(rate) = self.fail_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(PaxbootError::msg(format!(
                    "invalid fail_rate {}",
                    rate
                )));
            }
        }

        let config_str = self.config.replace('+', "\n");
        let mut config = LauncherConfig::from_toml(
            Some(config_str.as_str()).filter(|s| !s.trim().is_empty()),
        )?;

        if let Some(ref name) = self.peer_policy {
            config.peer_policy =
                PeerPolicy::parse_name(name).ok_or_else(|| {
                    PaxbootError::msg(format!(
                        "peer policy '{}' unrecognized",
                        name
                    ))
                })?;
        }
        if let Some(ref name) = self.payload_format {
            config.payload_format = PayloadFormat::parse_name(name)
                .ok_or_else(|| {
                    PaxbootError::msg(format!(
                        "payload format '{}' unrecognized",
                        name
                    ))
                })?;
        }
        Ok((self.num_replicas as u8, config))
    }
}

/// Actual main function of PaxBoot launcher.
fn launcher_main() -> Result<(), PaxbootError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let (population, config) = args.sanitize()?;

    // validate and plan everything before any replica gets started
    let mut launcher = Launcher::new_and_setup(
        config,
        population,
        args.fail_rate,
        ProcessSpawner,
    )?;

    if args.dry_run {
        let exe = &launcher.config().server_exe;
        for plan in launcher.plan() {
            pf_info!("{}: {}", plan, plan.command_line(exe));
        }
        return Ok(());
    }

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // launch orchestration is strictly sequential, a single-threaded
        // runtime is enough
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("tokio-launcher")
            .build()?;

        runtime.block_on(async move {
            // a signal caught mid-launch already released the replicas
            if launcher.launch(&mut rx_term).await? {
                launcher.run(rx_term).await?;
            }

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), PaxbootError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of PaxBoot launcher.
fn main() -> ExitCode {
    logger_init();
    me_init("l");

    if let Err(ref e) = launcher_main() {
        pf_error!("launcher_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn args_of(num_replicas: i64, fail_rate: Option<f64>) -> CliArgs {
        CliArgs {
            num_replicas,
            fail_rate,
            config: "".into(),
            peer_policy: None,
            payload_format: None,
            dry_run: false,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), PaxbootError> {
        let (population, config) = args_of(3, None).sanitize()?;
        assert_eq!(population, 3);
        assert_eq!(config, LauncherConfig::default());
        Ok(())
    }

    #[test]
    fn sanitize_with_config() -> Result<(), PaxbootError> {
        let args = CliArgs {
            config: "payload_format='positional'+peer_policy='exclude_self'"
                .into(),
            ..args_of(5, None)
        };
        let (population, config) = args.sanitize()?;
        assert_eq!(population, 5);
        assert_eq!(config.payload_format, PayloadFormat::Positional);
        assert_eq!(config.peer_policy, PeerPolicy::ExcludeSelf);
        Ok(())
    }

    #[test]
    fn sanitize_invalid_num_replicas() {
        assert!(args_of(0, None).sanitize().is_err());
        assert!(args_of(-1, None).sanitize().is_err());
        assert!(args_of(256, None).sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_fail_rate() {
        assert!(args_of(3, Some(1.01)).sanitize().is_err());
        assert!(args_of(3, Some(-0.5)).sanitize().is_err());
        assert!(args_of(3, Some(0.3)).sanitize().is_ok());
    }

    #[test]
    fn sanitize_with_policy_options() -> Result<(), PaxbootError> {
        let args = CliArgs {
            config: "peer_policy='include_self'".into(),
            peer_policy: Some("exclude_self".into()),
            payload_format: Some("positional".into()),
            ..args_of(3, None)
        };
        let (_, config) = args.sanitize()?;
        assert_eq!(config.peer_policy, PeerPolicy::ExcludeSelf);
        assert_eq!(config.payload_format, PayloadFormat::Positional);
        Ok(())
    }

    #[test]
    fn sanitize_invalid_policy_options() {
        let args = CliArgs {
            peer_policy: Some("everyone".into()),
            ..args_of(3, None)
        };
        assert!(args.sanitize().is_err());
        let args = CliArgs {
            payload_format: Some("json".into()),
            ..args_of(3, None)
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn parse_policy_options() -> Result<(), PaxbootError> {
        let args = CliArgs::try_parse_from([
            "paxboot_launcher",
            "3",
            "--peer-policy",
            "exclude_self",
            "--payload-format",
            "positional",
        ])
        .map_err(|e| PaxbootError::msg(e.to_string()))?;
        assert_eq!(args.peer_policy.as_deref(), Some("exclude_self"));
        assert_eq!(args.payload_format.as_deref(), Some("positional"));
        assert_eq!(args.fail_rate, None);
        Ok(())
    }

    #[test]
    fn sanitize_invalid_config() {
        let args = CliArgs {
            config: "stagger = 5".into(),
            ..args_of(3, None)
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn parse_positionals() -> Result<(), PaxbootError> {
        let args =
            CliArgs::try_parse_from(["paxboot_launcher", "5", "0.3"]).map_err(
                |e| PaxbootError::msg(e.to_string()),
            )?;
        assert_eq!(args.num_replicas, 5);
        assert_eq!(args.fail_rate, Some(0.3));
        assert!(!args.dry_run);

        let args = CliArgs::try_parse_from(["paxboot_launcher", "-1"])
            .map_err(|e| PaxbootError::msg(e.to_string()))?;
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn parse_non_numeric() {
        assert!(CliArgs::try_parse_from(["paxboot_launcher"]).is_err());
        assert!(
            CliArgs::try_parse_from(["paxboot_launcher", "three"]).is_err()
        );
        assert!(
            CliArgs::try_parse_from(["paxboot_launcher", "3", "abc"]).is_err()
        );
    }
}
