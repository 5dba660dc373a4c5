//! Cascade node daemon.
//!
//! Runs one cluster member until the cluster is asked to terminate. Every
//! member must be started with the same `--member` list.
//!
//! # Usage
//!
//! ```sh
//! cascade-node --name a --member a=10.0.0.1:7000 --member b=10.0.0.2:7000
//! ```
//!
//! With `--demo <N>` the coordinator submits one chain that counts `N`
//! generated records, waits for its termination record and then terminates
//! the cluster.

use std::sync::Arc;
use std::time::Duration;

use cascade::chain::Chain;
use cascade::config::EngineConfig;
use cascade::engine::{Collaborators, Engine, EngineError, TerminationLog};
use cascade::input::{InputRegistry, MemoryLayer};
use cascade::net::{Endpoint, Member};
use cascade::stage::{ChildBuffers, Emitter, Stage, StageContext, StageError, StagePool};
use cascade::types::{ChainId, InputLayerId, PartitionId, SubmissionId};
use cascade::value::{Record, Value};

/// How long the demo waits for its chain to terminate.
const DEMO_TIMEOUT: Duration = Duration::from_secs(60);

fn main() {
    cascade::init_tracing();
    if let Err(e) = run() {
        eprintln!("cascade-node: {e}");
        std::process::exit(1);
    }
}

struct Args {
    config: EngineConfig,
    demo_records: Option<i64>,
}

fn run() -> Result<(), EngineError> {
    let args: Vec<String> = std::env::args().collect();
    let Args {
        config,
        demo_records,
    } = parse_args(&args)?;

    eprintln!(
        "cascade-node: starting {} with {} member(s)",
        config.transport.local_name,
        config.transport.members.len()
    );

    let terminations = Arc::new(TerminationLog::new());
    let mut stages = StagePool::new();
    stages.register("count", Count::default);
    let mut inputs = InputRegistry::new();
    let records = (0..demo_records.unwrap_or(0))
        .map(|i| Record::from(vec![Value::Int(i)]))
        .collect();
    inputs.register(InputLayerId::DEFAULT, Arc::new(MemoryLayer::new(records)));

    let engine = Engine::start(
        config,
        Collaborators::new(stages, inputs, terminations.clone()),
    )?;
    eprintln!("cascade-node: ready as partition {}", engine.partition());

    if demo_records.is_some() && engine.partition() == PartitionId::COORDINATOR {
        let chain = Chain::new(ChainId::new(1), SubmissionId::new(1), engine.partition())
            .with_stage("count", Vec::new())?;
        engine.submit(chain)?;
        if terminations.wait_for(1, DEMO_TIMEOUT) {
            eprintln!("cascade-node: demo chain terminated");
        } else {
            eprintln!("cascade-node: demo chain did not terminate in time");
        }
        engine.terminate_cluster();
    }

    engine.wait_for_termination();
    eprintln!("cascade-node: shutting down...");
    engine.shutdown();
    eprintln!("cascade-node: stopped");
    Ok(())
}

/// Counts the records it sees and logs the total at the end.
#[derive(Default)]
struct Count {
    seen: u64,
}

impl Stage for Count {
    fn start_process(
        &mut self,
        _ctx: &mut StageContext,
        _chain: &mut Chain,
        _params: &[Value],
    ) -> Result<(), StageError> {
        self.seen = 0;
        Ok(())
    }

    fn process(
        &mut self,
        _record: &Record,
        _chain: &mut Chain,
        _children: &mut ChildBuffers,
        _downstream: &mut Emitter<'_>,
        _ctx: &mut StageContext,
    ) -> Result<(), StageError> {
        self.seen += 1;
        Ok(())
    }

    fn stop_process(
        &mut self,
        ctx: &mut StageContext,
        chain: &mut Chain,
        _downstream: &mut Emitter<'_>,
        _children: &mut ChildBuffers,
    ) -> Result<(), StageError> {
        eprintln!(
            "cascade-node: chain {} counted {} record(s) on partition {}",
            chain.id(),
            self.seen,
            ctx.partition()
        );
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidArgument(msg.into())
}

/// Parses command line arguments into an engine configuration.
fn parse_args(args: &[String]) -> Result<Args, EngineError> {
    let mut config = EngineConfig::default();
    let mut demo_records = None;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| invalid(format!("missing value for {flag}")))
        };
        match flag {
            "--name" | "-n" => config.transport.local_name = value()?,
            "--member" | "-m" => {
                let spec = value()?;
                let (name, addr) = spec
                    .split_once('=')
                    .ok_or_else(|| invalid(format!("expected name=host:port, got {spec}")))?;
                let endpoint: Endpoint = addr
                    .parse()
                    .map_err(|e| invalid(format!("bad address {addr}: {e}")))?;
                config.transport.members.push(Member::new(name, endpoint));
            }
            "--handlers" => {
                config.handlers = value()?
                    .parse()
                    .map_err(|e| invalid(format!("bad --handlers: {e}")))?;
            }
            "--resolvers" => {
                config.resolvers = value()?
                    .parse()
                    .map_err(|e| invalid(format!("bad --resolvers: {e}")))?;
            }
            "--demo" => {
                demo_records = Some(
                    value()?
                        .parse()
                        .map_err(|e| invalid(format!("bad --demo: {e}")))?,
                );
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(invalid(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    if config.transport.local_name.is_empty() {
        return Err(invalid("--name is required"));
    }
    if config.transport.members.is_empty() {
        return Err(invalid("at least one --member is required"));
    }

    Ok(Args {
        config,
        demo_records,
    })
}

fn print_usage() {
    eprintln!(
        r#"cascade-node - Cascade chain-execution node

USAGE:
    cascade-node --name <NAME> --member <NAME=ADDR>... [OPTIONS]

OPTIONS:
    -n, --name <NAME>          Name of this node among the members
    -m, --member <NAME=ADDR>   Add a cluster member (repeat for every node)
        --handlers <N>         Chain handler threads (default: 4)
        --resolvers <N>        Resolver threads (default: 1)
        --demo <N>             Coordinator submits a chain counting N records
    -h, --help                 Print this help message

EXAMPLE:
    cascade-node --name a --member a=127.0.0.1:7000 --member b=127.0.0.1:7001
"#
    );
}
