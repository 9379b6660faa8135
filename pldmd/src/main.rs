// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM management controller daemon.
 *
 * Copyright (c) 2025 Code Construct
 */

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use argh::FromArgs;

use pldmd::config;
use pldmd::daemon::Daemon;
use pldmd::dump::dump_pdrs;
use pldmd::sink::LogSink;
use pldmd::transport_unix::UnixBinding;
use pldmd_base::transport::Eid;

#[derive(FromArgs, Debug)]
#[argh(description = "PLDM management controller daemon")]
struct Args {
    /// debug logging
    #[argh(switch, short = 'd')]
    debug: bool,

    /// trace logging
    #[argh(switch)]
    trace: bool,

    /// transport socket path
    #[argh(option)]
    socket: String,

    /// endpoint IDs to initialise at startup
    #[argh(option)]
    eid: Vec<u8>,

    /// sensor poll interval in milliseconds
    #[argh(option, default = "1000")]
    poll_interval: u64,

    /// number of poll cycles to run, 0 for forever
    #[argh(option, default = "0")]
    cycles: usize,

    /// firmware update package to apply after init
    #[argh(option)]
    update: Option<String>,

    /// directory to dump each terminus's PDRs into after init
    #[argh(option)]
    dump_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    let level = if args.trace {
        log::LevelFilter::Trace
    } else if args.debug || config::debug_enabled() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new().filter_level(level).init();

    if args.eid.is_empty() {
        bail!("no endpoints given, pass at least one --eid");
    }

    smol::block_on(async {
        let binding = UnixBinding::connect(&args.socket)
            .await
            .with_context(|| {
                format!("can't connect to transport socket {}", args.socket)
            })?;
        let mut daemon = Daemon::new(binding, LogSink);

        for eid in &args.eid {
            daemon.device_added(Eid(*eid)).await;
        }

        if let Some(dir) = &args.dump_dir {
            for terminus in daemon.termini() {
                if let Some(platform) = &terminus.platform {
                    if let Err(e) = dump_pdrs(platform, dir) {
                        error!(
                            "TID {}: PDR dump failed: {e}",
                            terminus.tid
                        );
                    }
                }
            }
        }

        if let Some(pkg) = &args.update {
            if let Err(e) = daemon.start_fw_update(pkg).await {
                error!("firmware update failed: {e}");
            }
        }

        let interval = Duration::from_millis(args.poll_interval);
        let mut cycle = 0usize;
        loop {
            daemon.poll_cycle().await;
            cycle += 1;
            if args.cycles != 0 && cycle >= args.cycles {
                break;
            }
            smol::Timer::after(interval).await;
        }

        daemon.shutdown().await;
        Ok(())
    })
}
