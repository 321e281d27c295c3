//! A thin CLI on top of `ethkit`: picks a back-end and chain, starts the
//! sync controller, and prints account state as it arrives. Demo/ops
//! entrypoint, not part of the library surface.

use std::sync::Arc;

use alloy_primitives::U256;
use clap::Parser;
use env_logger::{Builder, Env};
use log::info;

use ethkit::address::validate_address;
use ethkit::{
    ApiBackend, Backend, ChainParams, EtherscanTxIndex, HttpRpcTransport, MemoryStore, Store, SyncController,
    WalletError,
};

#[derive(Parser)]
#[clap(version, author = "ethkit", about = "Ethereum wallet-kit account sync demo")]
struct Opts {
    /// Account address to sync.
    #[clap(long)]
    address: String,

    /// JSON-RPC endpoint of the node to sync against.
    #[clap(long)]
    rpc_url: String,

    /// Etherscan-style transaction-index base URL.
    #[clap(long, default_value = "https://api-ropsten.etherscan.io")]
    tx_index_url: String,

    /// Etherscan-style API key.
    #[clap(long, default_value = "")]
    tx_index_api_key: String,

    /// Network to validate headers/chain id against.
    #[clap(long, default_value = "ropsten")]
    chain: String,
}

fn init_logger() {
    let env = Env::default().filter_or("RUST_LOG", "info").write_style_or("RUST_LOG_STYLE", "always");
    Builder::from_env(env).format_timestamp(None).format_target(false).init();
    info!("logger initialized");
}

fn chain_params(name: &str) -> anyhow::Result<ChainParams> {
    match name {
        "mainnet" => Ok(ChainParams::mainnet()),
        "ropsten" => Ok(ChainParams::ropsten()),
        other => anyhow::bail!("unknown chain {other:?}, expected \"mainnet\" or \"ropsten\""),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();
    let opts = Opts::parse();

    let address = validate_address(&opts.address).map_err(WalletError::from)?;
    let chain = chain_params(&opts.chain)?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let rpc = HttpRpcTransport::new(&opts.rpc_url)?;
    let tx_index = EtherscanTxIndex::new(opts.tx_index_url, opts.tx_index_api_key);

    // Open Question #1: the native+registration controller is the only
    // variant this crate implements.
    let prepared = SyncController::prepare_sink();
    let sink = prepared.sink();

    // TODO: wire a private key source (env var / wallet file) once `send`
    // is exposed through this CLI; reading a key from `--address` alone is
    // not possible.
    let backend: Arc<dyn Backend> =
        Arc::new(ApiBackend::new(rpc, tx_index, store.clone(), sink, address, [0u8; 32], chain));

    let controller = SyncController::new(backend, prepared, store, address);
    controller.start().await?;

    let mut sync_state = controller.sync_state_stream();
    let mut last_block_height = controller.last_block_height_stream();
    let mut balance = controller.balance_stream();

    ctrlc::set_handler({
        let controller = controller.clone();
        move || {
            let controller = controller.clone();
            tokio::spawn(async move {
                if let Err(err) = controller.stop().await {
                    log::error!("error stopping controller: {err}");
                }
                std::process::exit(0);
            });
        }
    })?;

    loop {
        tokio::select! {
            Ok(()) = sync_state.changed() => {
                info!("sync state: {:?}", *sync_state.borrow());
            }
            Ok(()) = last_block_height.changed() => {
                info!("last block height: {:?}", *last_block_height.borrow());
            }
            Ok(()) = balance.changed() => {
                let value: Option<U256> = *balance.borrow();
                info!("balance: {value:?}");
            }
        }
    }
}
