//! backflow – RPC chunk server, file push client, and a local relay demo.
//
//  $ backflow serve --config backflow.toml
//  $ backflow push 127.0.0.1:5005 ./some-dir
//  $ backflow relay ./some.iso --delay-ms 70
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use backflow::core::flow::{direct_pusher, wait_popper, Watermarks};
use backflow::core::pipe::{
    file_source, FileChunk, QueueToConsumerPipe, QueueToQueuePipe, StreamToQueuePipe,
};
use backflow::rpc::{
    push_tree, serve_requests, ChunkStore, PushSettings, RpcClient, RpcReply, RpcRequest,
};
use backflow::transport::{
    Correlated, DuplexConnection, FramedConnection, IncomingRequest, OutgoingReply,
};
use backflow::{load_config, Config, Queue, QueueRegistry, Transport, TransportChannels};

#[derive(Debug, Parser)]
#[command(name = "backflow", version, about = "Backpressured pipelines & RPC transport")]
struct Cli {
    /// Path to config TOML (env BACKFLOW_CONFIG overrides)
    #[arg(short, long, global = true, default_value = "backflow.toml")]
    config: String,

    /// Log filter used when neither BACKFLOW_LOG nor RUST_LOG is set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept connections and store the chunks peers push.
    Serve,
    /// Push a file or directory tree to a running server, resuming
    /// partially stored files.
    Push {
        /// Server address (host:port)
        addr: SocketAddr,
        path: PathBuf,
    },
    /// Run a file through three local queues into a slow consumer.
    Relay {
        file: PathBuf,
        /// Consumer delay per chunk
        #[arg(long, default_value_t = 70)]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    backflow::logging::init_logging_with(&cli.log_level);

    let cfg_path: String = std::env::var("BACKFLOW_CONFIG").unwrap_or(cli.config);
    let cfg: Config = if Path::new(&cfg_path).exists() {
        load_config(&cfg_path)?
    } else {
        info!(path = %cfg_path, "no config file, using defaults");
        Config::default()
    };

    match cli.cmd {
        Command::Serve => serve(cfg).await,
        Command::Push { addr, path } => push(cfg, addr, path).await,
        Command::Relay { file, delay_ms } => relay(cfg, file, delay_ms).await,
    }
}

// ───────────────────────────────────────────────────────────
// Server
// ───────────────────────────────────────────────────────────
async fn serve(cfg: Config) -> anyhow::Result<()> {
    let marks = cfg.transport.watermarks()?;
    let store = Arc::new(ChunkStore::new(&cfg.server.store_dir));
    let listener = TcpListener::bind(&cfg.server.bind_addr).await?;
    info!(addr = %cfg.server.bind_addr, store = %store.root().display(), "backflow server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            info!(%peer, "session opened");
            if let Err(err) = handle_peer(stream, store, marks).await {
                error!(%peer, error = %err, "session failed");
            }
            info!(%peer, "session closed");
        });
    }
}

async fn handle_peer(stream: TcpStream, store: Arc<ChunkStore>, marks: Watermarks) -> anyhow::Result<()> {
    let (connection, reader) = FramedConnection::new(stream);

    let tx_in = Queue::<RpcRequest>::new("rpc-tx-in");
    let tx_out = Queue::<Correlated<RpcRequest, RpcReply>>::new("rpc-tx-out");
    let rx_out = Queue::<IncomingRequest<RpcRequest>>::new("rpc-rx-out");
    let rx_in = Queue::<OutgoingReply<RpcReply>>::new("rpc-rx-in");

    let transport = Transport::new(
        TransportChannels::from_queues(&tx_in, &tx_out, &rx_out, &rx_in),
        connection.clone(),
        marks,
    );
    let reading = reader.attach(transport.inbound());
    let handle = transport.start();

    // This side never issues requests.
    tx_in.finish();

    let answered = serve_requests(&wait_popper(&rx_out), &direct_pusher(&rx_in), &*store).await?;
    info!(answered, "peer finished sending");

    handle.join().await?;
    connection.close().await;
    reading.await??;
    Ok(())
}

// ───────────────────────────────────────────────────────────
// Push client
// ───────────────────────────────────────────────────────────
async fn push(cfg: Config, addr: SocketAddr, path: PathBuf) -> anyhow::Result<()> {
    let settings = PushSettings::from_config(&cfg.pipeline)?;
    let stream = TcpStream::connect(addr).await?;
    let (connection, reader) = FramedConnection::new(stream);
    info!(%addr, path = %path.display(), "connected, pushing");

    let tx_in = Queue::<RpcRequest>::new("rpc-tx-in");
    let tx_out = Queue::<Correlated<RpcRequest, RpcReply>>::new("rpc-tx-out");
    let rx_out = Queue::<IncomingRequest<RpcRequest>>::new("rpc-rx-out");
    let rx_in = Queue::<OutgoingReply<RpcReply>>::new("rpc-rx-in");

    let transport = Transport::new(
        TransportChannels::from_queues(&tx_in, &tx_out, &rx_out, &rx_in),
        connection.clone(),
        cfg.transport.watermarks()?,
    );
    let reading = reader.attach(transport.inbound());
    let handle = transport.start();

    // Nothing to answer on this side.
    rx_in.finish();

    let client = RpcClient::new();
    let greeting = async {
        let outcome = async {
            client.ping().await?;
            client.double(21).await
        }
        .await;
        client.close();
        let doubled = outcome?;
        info!(doubled, "server answers calls");
        Ok::<_, anyhow::Error>(())
    };
    let pushing = async {
        push_tree(&path, &client, &tx_in, &tx_out, settings)
            .await
            .map_err(anyhow::Error::from)
    };
    let ((), report) = tokio::try_join!(greeting, pushing)?;

    connection.close().await;
    handle.join().await?;
    reading.await??;

    info!(
        offered = report.offered,
        transferred = report.transferred,
        chunks = report.chunks,
        bytes = report.bytes,
        "push complete"
    );
    Ok(())
}

// ───────────────────────────────────────────────────────────
// Local relay demo
// ───────────────────────────────────────────────────────────
async fn relay(cfg: Config, file: PathBuf, delay_ms: u64) -> anyhow::Result<()> {
    let registry = Arc::new(QueueRegistry::new());
    let q1 = Queue::<FileChunk>::new("q1");
    let q2 = Queue::<FileChunk>::new("q2");
    let q3 = Queue::<FileChunk>::new("q3");
    for queue in [&q1, &q2, &q3] {
        registry.register(queue);
    }
    let reporter = registry.spawn_reporter(Duration::from_millis(500));

    let stage = cfg.pipeline.stage_watermarks()?;
    let source = file_source(&file, 0, cfg.pipeline.chunk_size)?;
    let s2q1 = StreamToQueuePipe::new(source, q1.clone(), cfg.pipeline.source_watermarks()?).start();
    let q1q2 = QueueToQueuePipe::new(q1, q2.clone(), stage).start();
    let q2q3 = QueueToQueuePipe::new(q2, q3.clone(), stage).start();

    let bytes = Arc::new(AtomicU64::new(0));
    let delay = Duration::from_millis(delay_ms);
    let consume = {
        let bytes = Arc::clone(&bytes);
        QueueToConsumerPipe::new(
            q3,
            move |chunk: FileChunk| {
                let bytes = Arc::clone(&bytes);
                async move {
                    bytes.fetch_add(chunk.data.len() as u64, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
            },
            || info!("relay drained"),
        )
        .start()
    };

    // The first failing stage ends the run; the others are dropped with it.
    let outcome = tokio::try_join!(s2q1, q1q2, q2q3, consume);
    reporter.abort();
    let (_, _, _, consumed) = outcome?;

    info!(chunks = consumed, bytes = bytes.load(Ordering::Relaxed), "relay complete");
    Ok(())
}
