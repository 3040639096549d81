/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context};
use clap::Parser;
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use web_time::Duration;

use snapclient::statistics::SessionStatistics;
use snapclient::{
    AudioFormat, AudioSink, Clock, ClientConfig, PcmDecoder, Player, Session, SharedState,
    SystemClock, TimeSyncStrategy,
};

/// Bytes queued between the player and the stdout writer (about 2 s of CD audio)
const OUTPUT_QUEUE_BYTES: usize = 384 * 1024;

#[derive(Parser, Debug)]
#[clap(about = "Synchronized multiroom audio client, raw PCM to stdout", version)]
struct Args {
    #[clap(long, help = "Server host name or address")]
    host: Option<String>,

    #[clap(long, short, help = "Server stream port")]
    port: Option<u16>,

    #[clap(long, help = "YAML configuration file")]
    config: Option<PathBuf>,

    #[clap(long, help = "Playout delay until the server sends its settings")]
    buffer_ms: Option<u32>,

    #[clap(long, help = "Additional output latency in milliseconds")]
    latency_ms: Option<i32>,

    #[clap(long, help = "Initial volume in percent (0-100)")]
    volume: Option<i32>,

    #[clap(long, help = "Time sync strategy: fixed, dynamic or dynamic-since-start")]
    sync: Option<TimeSyncStrategy>,

    #[clap(long, help = "Client name announced to the server")]
    name: Option<String>,

    #[clap(long, help = "Instance id, for several clients on one host")]
    instance: Option<u32>,

    #[clap(
        long,
        default_value_t = 10,
        help = "Seconds between statistics log lines (0 disables)"
    )]
    stats_interval_secs: u64,
}

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str::<ClientConfig>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => ClientConfig::default(),
    };

    if let Some(host) = &args.host {
        config.server_host = host.clone();
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(buffer_ms) = args.buffer_ms {
        config.buffer.buffer_size_ms = buffer_ms;
    }
    if let Some(latency_ms) = args.latency_ms {
        config.controller.initial_latency_ms = latency_ms;
    }
    if let Some(volume) = args.volume {
        config.controller.initial_volume_percent = volume.clamp(0, 100);
    }
    if let Some(strategy) = args.sync {
        config.time_sync.strategy = strategy;
    }
    if let Some(name) = &args.name {
        config.hello.client_name = name.clone();
    }
    if let Some(instance) = args.instance {
        config.hello.instance = instance;
    }

    config.validate()?;
    Ok(config)
}

/// Raw PCM on stdout, written by a dedicated thread from an SPSC queue.
///
/// Gain is applied to 16 bit samples. The speed factor is realized by
/// dropping or repeating single frames as the fractional drift accumulates.
struct StdoutSink {
    producer: HeapProducer<u8>,
    format: Option<AudioFormat>,
    speed_factor: f64,
    drift_frames: f64,
    gain: f32,
    muted: bool,
}

impl StdoutSink {
    fn spawn(
        capacity: usize,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<(Self, thread::JoinHandle<()>)> {
        let (producer, consumer) = HeapRb::<u8>::new(capacity).split();
        let writer = thread::Builder::new()
            .name("stdout-writer".to_string())
            .spawn(move || write_stdout(consumer, stop))?;
        let sink = Self {
            producer,
            format: None,
            speed_factor: 1.0,
            drift_frames: 0.0,
            gain: 1.0,
            muted: false,
        };
        Ok((sink, writer))
    }

    fn adjust(&mut self, pcm: &[u8]) -> Vec<u8> {
        let Some(format) = self.format else {
            return pcm.to_vec();
        };
        let frame = format.bytes_per_frame();
        if frame == 0 || pcm.len() < frame {
            return pcm.to_vec();
        }

        let frames = pcm.len() / frame;
        self.drift_frames += frames as f64 * (self.speed_factor - 1.0);
        let mut out = pcm.to_vec();
        if self.drift_frames >= 1.0 {
            // Ahead of target: play faster by skipping the last frame
            out.truncate(out.len() - frame);
            self.drift_frames -= 1.0;
        } else if self.drift_frames <= -1.0 {
            let last = out[out.len() - frame..].to_vec();
            out.extend_from_slice(&last);
            self.drift_frames += 1.0;
        }

        if format.bits_per_sample == 16 {
            let gain = if self.muted { 0.0 } else { self.gain };
            if gain != 1.0 {
                for sample in out.chunks_exact_mut(2) {
                    let value = i16::from_le_bytes([sample[0], sample[1]]) as f32 * gain;
                    let scaled = value.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                    sample.copy_from_slice(&scaled.to_le_bytes());
                }
            }
        } else if self.muted {
            out.fill(0);
        }
        out
    }
}

impl AudioSink for StdoutSink {
    fn configure(&mut self, format: AudioFormat) -> snapclient::Result<()> {
        self.format = Some(format);
        self.drift_frames = 0.0;
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> snapclient::Result<usize> {
        let adjusted = self.adjust(pcm);
        let pushed = self.producer.push_slice(&adjusted);
        if pushed < adjusted.len() {
            log::warn!(
                "Output queue full, dropped {} bytes",
                adjusted.len() - pushed
            );
        }
        Ok(pcm.len().min(pushed))
    }

    fn set_speed_factor(&mut self, factor: f64) {
        self.speed_factor = factor;
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }
}

fn write_stdout(mut consumer: HeapConsumer<u8>, stop: Arc<AtomicBool>) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut chunk = vec![0u8; 16 * 1024];
    while !stop.load(Ordering::Relaxed) {
        let n = consumer.pop_slice(&mut chunk);
        if n == 0 {
            thread::sleep(Duration::from_millis(2));
            continue;
        }
        if let Err(e) = out.write_all(&chunk[..n]).and_then(|_| out.flush()) {
            log::error!("stdout closed: {e}");
            stop.store(true, Ordering::Relaxed);
        }
    }
}

/// Output flow: run player cycles until asked to stop
fn run_output(
    mut player: Player<StdoutSink>,
    clock: Arc<dyn Clock>,
    session_stats: Arc<Mutex<SessionStatistics>>,
    stats_interval: Duration,
    stop: Arc<AtomicBool>,
) {
    let mut last_stats = clock.now();
    while !stop.load(Ordering::Relaxed) {
        let now = clock.now();
        let sleep = match player.cycle(now) {
            Ok(report) => {
                if let Some(condition) = &report.condition {
                    log::trace!("Output cycle: {condition}");
                }
                report.schedule.sleep
            }
            Err(e) => {
                log::error!("Output cycle failed: {e}");
                if e.is_session_fatal() {
                    stop.store(true, Ordering::Relaxed);
                }
                Duration::from_millis(100)
            }
        };

        if !stats_interval.is_zero()
            && now.micros_since(last_stats) >= stats_interval.as_micros() as i64
        {
            last_stats = now;
            let session = session_stats
                .lock()
                .map(|guard| guard.clone())
                .unwrap_or_default();
            match player
                .snapshot(&session)
                .map_err(anyhow::Error::from)
                .and_then(|snapshot| Ok(serde_json::to_string(&snapshot)?))
            {
                Ok(json) => log::info!("stats {json}"),
                Err(e) => log::warn!("Could not collect statistics: {e}"),
            }
        }

        thread::sleep(sleep);
    }
    log::info!("Output thread stopped");
}

/// One connection: handshake, then stream until an error or shutdown
async fn run_connection(
    session: &mut Session,
    config: &ClientConfig,
    clock: &dyn Clock,
    session_stats: &Mutex<SessionStatistics>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let address = format!("{}:{}", config.server_host, config.server_port);
    log::info!("Connecting to {address}");
    let mut stream = tokio::time::timeout(
        config.session.receive_timeout(),
        TcpStream::connect(&address),
    )
    .await
    .with_context(|| format!("connecting to {address} timed out"))?
    .with_context(|| format!("connecting to {address}"))?;
    stream.set_nodelay(true)?;

    let hello = session.connect(clock.now())?;
    stream.write_all(&hello).await?;
    log::info!("Connected to {address}");

    let mut buf = vec![0u8; 64 * 1024];
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = read.context("reading from server")?;
                if n == 0 {
                    bail!("server closed the connection");
                }
                session.on_bytes(&buf[..n], clock.now())?;
            }
            _ = tick.tick() => {
                if let Some(probe) = session.poll(clock.now())? {
                    stream.write_all(&probe).await?;
                }
                if let Ok(mut stats) = session_stats.lock() {
                    *stats = session.statistics().clone();
                }
            }
            _ = shutdown.changed() => {
                log::info!("Shutdown requested, closing connection");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    log::info!(
        "Client '{}' instance {}, time sync {:?}",
        config.hello.client_name,
        config.hello.instance,
        config.time_sync.strategy
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let shared = Arc::new(SharedState::new(&config, Box::new(PcmDecoder::new())));
    let mut session = Session::new(&config, Arc::clone(&shared))?;
    let session_stats = Arc::new(Mutex::new(SessionStatistics::default()));

    let stop = Arc::new(AtomicBool::new(false));
    let (sink, writer) = StdoutSink::spawn(OUTPUT_QUEUE_BYTES, Arc::clone(&stop))
        .context("spawning stdout writer")?;
    let player = Player::new(Arc::clone(&shared), sink, &config);
    let output = {
        let clock = Arc::clone(&clock);
        let session_stats = Arc::clone(&session_stats);
        let stop = Arc::clone(&stop);
        let interval = Duration::from_secs(args.stats_interval_secs);
        thread::Builder::new()
            .name("output".to_string())
            .spawn(move || run_output(player, clock, session_stats, interval, stop))
            .context("spawning output thread")?
    };

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                log::warn!("Ctrl-C handler unavailable: {e}");
                // Hold the sender so receivers never see a closed channel
                std::future::pending::<()>().await;
            }
        }
    });

    while !*shutdown_rx.borrow() && !stop.load(Ordering::Relaxed) {
        let result = run_connection(
            &mut session,
            &config,
            clock.as_ref(),
            &session_stats,
            &mut shutdown_rx,
        )
        .await;
        session.disconnect()?;

        match result {
            Ok(()) => break,
            Err(e) => log::warn!(
                "Session ended: {e:#}, reconnecting in {} ms",
                config.session.reconnect_delay_ms
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(config.session.reconnect_delay()) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    stop.store(true, Ordering::Relaxed);
    tokio::task::spawn_blocking(move || {
        let _ = output.join();
        let _ = writer.join();
    })
    .await?;
    log::info!("Stopped");
    Ok(())
}
