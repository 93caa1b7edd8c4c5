//! Ringstore server node executable.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::sync::watch;

use ringstore::{pf_error, pf_warn, CommitNode, NodeId, RingStoreError};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Node ID of myself.
    #[arg(short, long)]
    id: NodeId,

    /// Key-value API port open to clients.
    #[arg(short, long, default_value_t = 52700)]
    api_port: u16,

    /// Internal port used for node-to-node messages.
    #[arg(short, long, default_value_t = 52800)]
    p2p_port: u16,

    /// List of node p2p addresses, the order of which maps to node IDs.
    /// Example: '-r host1:p2p1 -r host2:p2p2 -r host3:p2p3'.
    #[arg(short, long)]
    replicas: Vec<SocketAddr>,

    /// Configuration string in TOML format.
    /// Example: "tx_timeout_ms = 2000"
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments.
    fn sanitize(&self) -> Result<(), RingStoreError> {
        // check for duplicate peers
        let mut replicas_set = HashSet::new();
        for addr in self.replicas.iter() {
            if replicas_set.contains(addr) {
                return Err(RingStoreError(format!(
                    "duplicate replica address '{}' given",
                    addr
                )));
            }
            replicas_set.insert(addr);
        }

        if (self.id as usize) >= self.replicas.len() {
            return Err(RingStoreError(format!(
                "invalid node ID {} / {}",
                self.id,
                self.replicas.len()
            )));
        }
        let my_addr = self.replicas[self.id as usize];

        if self.api_port <= 1024 {
            Err(RingStoreError(format!(
                "invalid api_port {}",
                self.api_port
            )))
        } else if self.p2p_port <= 1024 {
            Err(RingStoreError(format!(
                "invalid p2p_port {}",
                self.p2p_port
            )))
        } else if self.api_port == self.p2p_port {
            Err(RingStoreError(format!(
                "api_port == p2p_port {}",
                self.api_port
            )))
        } else if self.p2p_port != my_addr.port() {
            Err(RingStoreError(format!(
                "p2p_port {} does not match replica addr '{}'",
                self.p2p_port, my_addr
            )))
        } else if self.threads < 2 {
            Err(RingStoreError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), RingStoreError> {
    let args = CliArgs::parse();
    args.sanitize()?;

    let population = args.replicas.len() as u8;
    let mut peer_addrs = HashMap::new();
    for (id, &addr) in args.replicas.iter().enumerate() {
        let id = id as NodeId;
        if id != args.id {
            peer_addrs.insert(id, addr);
        }
    }

    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.api_port).parse()?;
    let p2p_addr: SocketAddr = format!("0.0.0.0:{}", args.p2p_port).parse()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-node{}", args.id))
        .build()?;

    // enter tokio runtime, set up the node, and run the main event loop
    runtime.block_on(async move {
        let mut node = CommitNode::new_and_setup(
            args.id,
            population,
            api_addr,
            p2p_addr,
            peer_addrs,
            args.config.as_deref(),
        )
        .await?;

        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                pf_warn!("interrupt signal received");
                let _ = tx_term.send(true);
            }
        });

        node.run(rx_term).await
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(true)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server_main exited: {}", e);
    }
}

#[cfg(test)]
mod server_args_tests {
    use super::*;

    fn valid_args() -> CliArgs {
        CliArgs {
            id: 1,
            api_port: 52701,
            p2p_port: 52801,
            replicas: vec![
                "127.0.0.1:52800".parse().unwrap(),
                "127.0.0.1:52801".parse().unwrap(),
            ],
            config: None,
            threads: 2,
        }
    }

    #[test]
    fn sanitize_valid() {
        assert!(valid_args().sanitize().is_ok());
    }

    #[test]
    fn sanitize_invalid_api_port() {
        let mut args = valid_args();
        args.api_port = 1023;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_same_api_p2p_port() {
        let mut args = valid_args();
        args.api_port = args.p2p_port;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_p2p_port_mismatch() {
        let mut args = valid_args();
        args.p2p_port = 52900;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_duplicate_replica() {
        let mut args = valid_args();
        args.replicas[0] = args.replicas[1];
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_id() {
        let mut args = valid_args();
        args.id = 2;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let mut args = valid_args();
        args.threads = 1;
        assert!(args.sanitize().is_err());
    }
}
