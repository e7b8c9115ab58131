use super::*;

#[derive(Clone, Debug, Parser)]
pub(crate) struct StoreOptions {
    #[arg(
        long,
        env = "MONGODB_URL",
        default_value = "mongodb://127.0.0.1:27017",
        help = "Connect to MongoDB at <MONGODB_URL>."
    )]
    pub(crate) mongodb_url: String,

    #[arg(
        long,
        env = "MONGODB_DB",
        default_value = "stratum-logger",
        help = "Use MongoDB database <MONGODB_DB>."
    )]
    pub(crate) mongodb_db: String,

    #[arg(
        long,
        env = "MONGODB_USERNAME",
        help = "Authenticate to MongoDB as <MONGODB_USERNAME>."
    )]
    pub(crate) mongodb_username: Option<String>,

    #[arg(
        long,
        env = "MONGODB_PASSWORD",
        help = "Authenticate to MongoDB with <MONGODB_PASSWORD>."
    )]
    pub(crate) mongodb_password: Option<String>,

    #[arg(
        long,
        env = "ENABLE_HISTORICAL_DATA",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Persist captured records to MongoDB. [default: true]"
    )]
    pub(crate) enable_historical_data: bool,
}

#[derive(Clone, Debug, Parser)]
pub(crate) struct BusOptions {
    #[arg(
        long,
        env = "RABBITMQ_HOST",
        default_value = "127.0.0.1",
        help = "Connect to the message bus at <RABBITMQ_HOST>."
    )]
    pub(crate) rabbitmq_host: String,

    #[arg(
        long,
        env = "RABBITMQ_PORT",
        default_value = "5672",
        help = "Connect to the message bus at <RABBITMQ_PORT>."
    )]
    pub(crate) rabbitmq_port: u16,

    #[arg(
        long,
        env = "RABBITMQ_USERNAME",
        default_value = "mquser",
        help = "Authenticate to the message bus as <RABBITMQ_USERNAME>."
    )]
    pub(crate) rabbitmq_username: String,

    #[arg(
        long,
        env = "RABBITMQ_PASSWORD",
        default_value = "mqpassword",
        help = "Authenticate to the message bus with <RABBITMQ_PASSWORD>."
    )]
    pub(crate) rabbitmq_password: String,

    #[arg(
        long,
        env = "RABBITMQ_EXCHANGE",
        default_value = "blocks",
        help = "Publish to the durable fanout exchange <RABBITMQ_EXCHANGE>."
    )]
    pub(crate) rabbitmq_exchange: String,

    #[arg(
        long,
        env = "RABBITMQ_HEARTBEAT",
        default_value = "30",
        help = "Negotiate a <RABBITMQ_HEARTBEAT> second broker heartbeat."
    )]
    pub(crate) rabbitmq_heartbeat: u16,

    #[arg(
        long,
        env = "RABBITMQ_RETRY_DELAY",
        default_value = "2",
        help = "Wait <RABBITMQ_RETRY_DELAY> seconds before bus retries."
    )]
    pub(crate) rabbitmq_retry_delay: u64,

    #[arg(
        long,
        env = "RABBITMQ_MAX_RETRIES",
        default_value = "5",
        help = "Attempt bus connections at most <RABBITMQ_MAX_RETRIES> times."
    )]
    pub(crate) rabbitmq_max_retries: u32,
}

#[derive(Clone, Debug, Parser)]
pub(crate) struct NodeOptions {
    #[arg(
        long,
        env = "BITCOIN_RPC_HOST",
        default_value = "127.0.0.1",
        help = "Connect to Bitcoin Core RPC at <BITCOIN_RPC_HOST>."
    )]
    pub(crate) bitcoin_rpc_host: String,

    #[arg(
        long,
        env = "BITCOIN_RPC_PORT",
        default_value = "8332",
        help = "Connect to Bitcoin Core RPC at <BITCOIN_RPC_PORT>."
    )]
    pub(crate) bitcoin_rpc_port: u16,

    #[arg(
        long,
        env = "BITCOIN_RPC_USER",
        default_value = "user",
        help = "Authenticate to Bitcoin Core RPC as <BITCOIN_RPC_USER>."
    )]
    pub(crate) bitcoin_rpc_username: String,

    #[arg(
        long,
        env = "BITCOIN_RPC_PASSWORD",
        default_value = "password",
        help = "Authenticate to Bitcoin Core RPC with <BITCOIN_RPC_PASSWORD>."
    )]
    pub(crate) bitcoin_rpc_password: String,

    #[arg(
        long,
        env = "BITCOIN_RPC_TIMEOUT",
        default_value = "10",
        help = "Time out Bitcoin Core RPC calls after <BITCOIN_RPC_TIMEOUT> seconds."
    )]
    pub(crate) bitcoin_rpc_timeout: u64,

    #[arg(
        long,
        env = "BITCOIN_ZMQ_BLOCK",
        default_value = "tcp://127.0.0.1:28332",
        help = "Subscribe to raw block notifications on <BITCOIN_ZMQ_BLOCK>."
    )]
    pub(crate) zmq_block_notifications: String,

    #[arg(
        long,
        env = "MIN_BLOCK_HEIGHT",
        default_value = "882000",
        help = "Backfill blocks no deeper than <MIN_BLOCK_HEIGHT>."
    )]
    pub(crate) min_block_height: u64,
}

#[derive(Clone, Debug, Parser)]
pub(crate) struct RuleSetOptions {
    #[arg(
        long,
        env = "POOL_LIST_URL",
        default_value = "https://raw.githubusercontent.com/mempool/mining-pools/refs/heads/master/pools-v2.json",
        help = "Fetch pool definitions from <POOL_LIST_URL>."
    )]
    pub(crate) pool_list_url: String,

    #[arg(
        long,
        env = "POOL_UPDATE_INTERVAL",
        default_value = "86400",
        help = "Reload pool definitions every <POOL_UPDATE_INTERVAL> seconds."
    )]
    pub(crate) pool_update_interval: u64,

    #[arg(
        long,
        env = "LOCAL_POOL_FILE",
        default_value = "pool_definitions.json",
        help = "Fall back to pool definitions in <LOCAL_POOL_FILE>."
    )]
    pub(crate) local_pool_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        node: NodeOptions,
        #[command(flatten)]
        rules: RuleSetOptions,
    }

    #[test]
    fn node_defaults() {
        let harness = Harness::try_parse_from(["vigil"]).unwrap();

        assert_eq!(harness.node.bitcoin_rpc_port, 8332);
        assert_eq!(harness.node.bitcoin_rpc_timeout, 10);
        assert_eq!(harness.node.min_block_height, 882_000);
        assert_eq!(
            harness.node.zmq_block_notifications,
            "tcp://127.0.0.1:28332"
        );
    }

    #[test]
    fn rule_set_defaults() {
        let harness = Harness::try_parse_from(["vigil"]).unwrap();

        assert_eq!(harness.rules.pool_update_interval, 86_400);
        assert_eq!(
            harness.rules.local_pool_file,
            PathBuf::from("pool_definitions.json")
        );
    }

    #[test]
    fn flags_override_defaults() {
        let harness = Harness::try_parse_from([
            "vigil",
            "--bitcoin-rpc-port",
            "18443",
            "--min-block-height",
            "100",
            "--pool-update-interval",
            "60",
        ])
        .unwrap();

        assert_eq!(harness.node.bitcoin_rpc_port, 18443);
        assert_eq!(harness.node.min_block_height, 100);
        assert_eq!(harness.rules.pool_update_interval, 60);
    }
}
