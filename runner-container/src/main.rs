use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ingest_edge::config::{FlowListenerConfig, FlowProtocol, IngestConfig, SinkConfig, SinkType, load_config};
use ingest_edge::record::Record;
use ingest_edge::shutdown::ShutdownAggregator;
use ingest_edge::sink::{JsonLinesSink, Sink, forward_records};
use ingest_edge::source::flow::{FlowDecoder, IpfixDecoder, NetflowV5Decoder};
use ingest_edge::source::listener::{FlowListener, ListenerRegistry};
use ingest_edge::telemetry::init_tracing;

const FINAL_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry point for running the ingestion edge as a long-lived container.
///
/// What it does at a high-level:
///     Load config (path argument, or `INGEST_CONFIG`).
///     Start every flow listener and Kafka consumer, all feeding one sink.
///     On Ctrl-C close everything through one shutdown aggregator, drain the
///     flow channel and sync the sink.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load configuration")?;

    let sink = Arc::new(build_sink(&config.sink).await?);
    let aggregator = ShutdownAggregator::new();
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let forwarder = tokio::spawn(forward_records(rx, Arc::clone(&sink)));

    let started = start_adapters(&config, &sink, &aggregator, tx);
    if started.is_ok() {
        info!("Ingestion edge running, waiting for shutdown signal");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutdown signal received");
    }

    if let Err(e) = aggregator.close().await {
        error!("Shutdown finished with errors: {}", e);
    }
    started?;

    let forwarded = forwarder.await.context("Record forwarder failed")?;
    sink.sync(&CancellationToken::new(), FINAL_SYNC_TIMEOUT)
        .await
        .context("Final sink sync failed")?;
    info!("Forwarded {} flow records, exiting", forwarded);
    Ok(())
}

async fn build_sink(config: &SinkConfig) -> Result<JsonLinesSink> {
    let sink = match config.target_type {
        SinkType::JsonLines => match &config.path {
            Some(path) => JsonLinesSink::create(path)
                .await
                .with_context(|| format!("Failed to open sink file {path}"))?,
            None => JsonLinesSink::stdout(),
        },
    };
    Ok(match config.source_address {
        Some(addr) => sink.with_source(addr),
        None => sink,
    })
}

/// Starts every configured adapter. Each one is registered with `aggregator`
/// before it starts, so a partial start-up is still torn down.
fn start_adapters(
    config: &IngestConfig,
    sink: &Arc<JsonLinesSink>,
    aggregator: &ShutdownAggregator,
    output: mpsc::Sender<Record>,
) -> Result<()> {
    let registry = ListenerRegistry::new();
    for (id, listener) in config.flow_listeners.iter().enumerate() {
        match listener.protocol {
            FlowProtocol::NetflowV5 => {
                start_listener(listener, id as i64, NetflowV5Decoder, sink, aggregator, &registry, &output)
            }
            FlowProtocol::Ipfix => start_listener(
                listener,
                id as i64,
                IpfixDecoder::default(),
                sink,
                aggregator,
                &registry,
                &output,
            ),
        }
        .with_context(|| format!("Failed to start flow listener {}", listener.name))?;
    }
    start_consumers(config, sink, aggregator)
}

fn start_listener<D: FlowDecoder>(
    config: &FlowListenerConfig,
    id: i64,
    decoder: D,
    sink: &Arc<JsonLinesSink>,
    aggregator: &ShutdownAggregator,
    registry: &ListenerRegistry,
    output: &mpsc::Sender<Record>,
) -> Result<()> {
    let tag = sink.register_tag(&config.tag)?;
    let listener = Arc::new(FlowListener::new(
        config.name.clone(),
        decoder,
        config.capture_settings(tag),
        output.clone(),
        registry.clone(),
        aggregator.tracker(),
    ));
    aggregator.register(listener.clone());

    listener.listen(&config.bind)?;
    listener.start(id)?;
    Ok(())
}

#[cfg(feature = "kafka")]
fn start_consumers(
    config: &IngestConfig,
    sink: &Arc<JsonLinesSink>,
    aggregator: &ShutdownAggregator,
) -> Result<()> {
    use ingest_edge::source::consumer::ConsumerCoordinator;
    use ingest_edge::source::kafka::KafkaGroupClient;

    for consumer in &config.kafka_consumers {
        let client = KafkaGroupClient::new(consumer)
            .with_context(|| format!("Failed to create Kafka client for {}", consumer.name))?;
        let coordinator = Arc::new(ConsumerCoordinator::new(
            consumer.consumer_settings(),
            Arc::clone(sink),
            consumer.extractor(),
        )?);
        let tracker = aggregator.register(coordinator.clone());
        coordinator.start(client, &tracker)?;
    }
    Ok(())
}

#[cfg(not(feature = "kafka"))]
fn start_consumers(
    config: &IngestConfig,
    _sink: &Arc<JsonLinesSink>,
    _aggregator: &ShutdownAggregator,
) -> Result<()> {
    if !config.kafka_consumers.is_empty() {
        anyhow::bail!("Kafka consumers are configured but this build lacks the `kafka` feature");
    }
    Ok(())
}
