use {
    analysis::AnalysisBundle,
    anyhow::{Context, Error, anyhow, bail, ensure},
    arguments::Arguments,
    bitcoin::{
        Transaction,
        block::Header,
        consensus,
        hashes::{Hash, sha256},
    },
    block_record::{BlockRecord, MiningPool},
    byteorder::{ByteOrder, LittleEndian},
    chrono::Utc,
    clap::Parser,
    derive_more::Display,
    futures::TryStreamExt,
    pools::{PoolDefinition, RuleSet},
    publisher::{Envelope, Publisher},
    rand::Rng,
    rpc::RpcPool,
    serde::{
        Deserialize, Serialize, Serializer,
        de::{self, Deserializer},
        ser::SerializeSeq,
    },
    serde_json::{Value, json},
    serde_with::{DeserializeFromStr, SerializeDisplay},
    std::{
        collections::{BTreeMap, HashMap, HashSet},
        fmt::{self, Display, Formatter},
        path::PathBuf,
        process,
        str::FromStr,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::{Duration, Instant, SystemTime, UNIX_EPOCH},
    },
    store::Store,
    stratum::{Endpoint, Message, Notify},
    template::NotifyTemplate,
    tokio::{
        io::AsyncWriteExt,
        net::{TcpListener, TcpStream},
        runtime::Runtime,
        sync::{Mutex, Semaphore, watch},
        task::{self, JoinSet},
        time::{sleep, timeout},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
    tracing_subscriber::EnvFilter,
    uuid::Uuid,
};

mod analysis;
mod arguments;
mod block_record;
mod coinbase;
mod options;
mod pools;
mod publisher;
mod reconciler;
mod rpc;
mod signal;
mod store;
pub mod stratum;
mod subcommand;
mod template;
mod zmq;

pub const COIN_VALUE: u64 = 100_000_000;
pub const USER_AGENT: &str = "vigil/0.1.0";

type Result<T = (), E = Error> = std::result::Result<T, E>;

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Arguments::parse();

    match args.run() {
        Err(err) => {
            error!("error: {err:#}");

            if std::env::var_os("RUST_BACKTRACE")
                .map(|val| val == "1")
                .unwrap_or_default()
            {
                error!("{}", err.backtrace());
            }
            process::exit(1);
        }
        Ok(_) => {
            process::exit(0);
        }
    }
}
