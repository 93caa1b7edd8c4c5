//! Ringstore interactive client executable: a small REPL over the client
//! API, useful for poking at a running ring.

use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::runtime::Builder;

use ringstore::{pf_error, OpFailure, RingClient, RingStoreError};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client API address of the node to connect to.
    #[arg(short, long, default_value = "127.0.0.1:52700")]
    node: SocketAddr,
}

const HELP_MSG: &str = "Commands:
  read <key>
  write <key> <value>
  tx <op> [args]...        (ops: read k | write k v | revert | commit | abort)
  publish <topic> <content>
  subscribe <topic> <url>
  unsubscribe <topic> <url>
  subscribers <topic>
  help
  exit";

fn print_failure(failure: OpFailure) {
    println!("-> {{fail, {}}}", failure);
}

async fn repl_iter(
    client: &mut RingClient,
    line: &str,
) -> Result<bool, RingStoreError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [] => {}

        ["read", key] => match client.read(key).await {
            Ok(value) => println!("-> {{ok, {}}}", value),
            Err(failure) => print_failure(failure),
        },

        ["write", key, value] => match client.write(key, value).await {
            Ok(()) => println!("-> {{ok}}"),
            Err(failure) => print_failure(failure),
        },

        // one whole transaction on a single line, e.g.:
        //   tx read a write b 7 commit
        ["tx", ops @ ..] => {
            let mut tx = client.tx_start();
            let mut idx = 0;
            while idx < ops.len() {
                match ops[idx] {
                    "read" if idx + 1 < ops.len() => {
                        match tx.read(ops[idx + 1]).await {
                            Ok(value) => println!("-> {{ok, {}}}", value),
                            Err(failure) => print_failure(failure),
                        }
                        idx += 2;
                    }
                    "write" if idx + 2 < ops.len() => {
                        match tx.write(ops[idx + 1], ops[idx + 2]).await {
                            Ok(()) => println!("-> {{ok}}"),
                            Err(failure) => print_failure(failure),
                        }
                        idx += 3;
                    }
                    "revert" => {
                        tx.revert_last_op();
                        println!("-> {{ok}}");
                        idx += 1;
                    }
                    "commit" => {
                        match tx.commit().await {
                            Ok(()) => println!("-> {{ok}}"),
                            Err(failure) => print_failure(failure),
                        }
                        return Ok(true);
                    }
                    "abort" => {
                        tx.abort();
                        println!("-> {{ok}}");
                        return Ok(true);
                    }
                    unknown => {
                        println!("unknown tx op '{}'", unknown);
                        return Ok(true);
                    }
                }
            }
            println!("tx line did not end in commit/abort; discarded");
        }

        ["publish", topic, content] => {
            match client.publish(topic, content).await {
                Ok(()) => println!("-> {{ok}}"),
                Err(failure) => print_failure(failure),
            }
        }

        ["subscribe", topic, url] => {
            match client.subscribe(topic, url).await {
                Ok(()) => println!("-> {{ok}}"),
                Err(failure) => print_failure(failure),
            }
        }

        ["unsubscribe", topic, url] => {
            match client.unsubscribe(topic, url).await {
                Ok(()) => println!("-> {{ok}}"),
                Err(failure) => print_failure(failure),
            }
        }

        ["subscribers", topic] => match client.get_subscribers(topic).await {
            Ok(urls) => println!("-> {:?}", urls),
            Err(failure) => print_failure(failure),
        },

        ["help"] => println!("{}", HELP_MSG),

        ["exit"] => {
            client.leave().await?;
            return Ok(false);
        }

        _ => println!("unrecognized command; try 'help'"),
    }
    Ok(true)
}

// Client executable main entrance.
fn client_main(args: CliArgs) -> Result<(), RingStoreError> {
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        let mut client = RingClient::new_and_connect(args.node).await?;
        println!("connected as client {}; 'help' lists commands", client.id());

        let mut lines = BufReader::new(io::stdin()).lines();
        let mut stdout = io::stdout();
        loop {
            stdout.write_all(b"ringstore> ").await?;
            stdout.flush().await?;
            let Some(line) = lines.next_line().await? else {
                break;
            };
            if !repl_iter(&mut client, &line).await? {
                break;
            }
        }
        Ok(())
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(true)
        .init();

    let args = CliArgs::parse();
    if let Err(e) = client_main(args) {
        pf_error!("client_main exited: {}", e);
    }
}
