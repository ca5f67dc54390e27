use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use parley::actions::{self, ChainExecutor};
use parley::config::file::config_file_path;
use parley::voice::{
    AudioLevelMeter, AudioPlayback, CloudSynthesizer, CpalSource, HttpRecognizer, MicEvent,
    MicUse, PLAYBACK_SAMPLE_RATE, SpeechSynthesizer, TtsEvent, VoiceParams, calculate_rms,
    normalize_for_speech, tone,
};
use parley::{
    ChatClient, ConversationEvent, ConversationState, ConversationTurn, Microphone, Orchestrator,
    Settings, SpeechCapture, SpeechPlayback,
};

/// How often the config file is checked for changes
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Parley - talk to a chat-completion model, and interrupt it
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Request whole replies instead of streaming them
    #[arg(long, env = "PARLEY_NO_STREAM", global = true)]
    no_stream: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Send one text turn and print the reply as it streams
    Ask {
        /// What to ask
        text: String,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Print the config file path
    ConfigPath,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,parley=info",
        1 => "info,parley=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load();
    apply_overrides(&settings, cli.no_stream);

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Ask { text } => ask(&settings, &text).await,
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => test_tts(&settings, &text).await,
            Command::ConfigPath => {
                match config_file_path() {
                    Some(path) => println!("{}", path.display()),
                    None => anyhow::bail!("no home directory; config file unavailable"),
                }
                Ok(())
            }
        };
    }

    converse(settings, cli.no_stream).await
}

/// Flags that must survive a settings reload
fn apply_overrides(settings: &Settings, no_stream: bool) {
    if no_stream {
        settings.update(|p| p.chat.stream = false);
    }
}

/// Run the voice loop until Ctrl-C
async fn converse(settings: Settings, no_stream: bool) -> anyhow::Result<()> {
    let prefs = settings.snapshot();
    tracing::info!(
        endpoint = %prefs.chat.endpoint,
        model = %prefs.chat.model,
        stream = prefs.chat.stream,
        "starting parley"
    );

    let mic = Microphone::new(CpalSource::new());
    let capture = SpeechCapture::new(
        mic.clone(),
        Arc::new(HttpRecognizer::new(settings.clone())),
        settings.clone(),
    );
    let playback = SpeechPlayback::new(
        Arc::new(CloudSynthesizer::new(settings.clone())),
        mic,
        settings.clone(),
    );
    let chat = ChatClient::new(settings.clone());
    let executor = Arc::new(ChainExecutor::standard(settings.clone()));

    let watcher = CancellationToken::new();
    tokio::spawn(watch_config(settings.clone(), no_stream, watcher.clone()));

    let (handle, mut events) =
        Orchestrator::new(capture, playback, chat, executor, settings).spawn();
    handle.start();
    tracing::info!("parley ready - start talking (Ctrl-C to quit)");

    let mut replying = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                handle.shutdown();
                break;
            }
            event = events.recv() => match event {
                Some(event) => render(&event, &mut replying),
                None => break,
            },
        }
    }

    // Drain until the loop has torn everything down
    while let Some(event) = events.recv().await {
        render(&event, &mut replying);
    }
    watcher.cancel();

    Ok(())
}

fn render(event: &ConversationEvent, replying: &mut bool) {
    match event {
        ConversationEvent::StateChanged(state) => {
            tracing::debug!(%state, "state");
            if *state == ConversationState::Listening {
                println!("\n[listening]");
            }
        }
        ConversationEvent::UserUtterance(text) => println!("you: {text}"),
        ConversationEvent::AssistantChunk(chunk) => {
            if !*replying {
                print!("assistant: ");
                *replying = true;
            }
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        }
        ConversationEvent::AssistantReply(text) => {
            if *replying {
                println!();
            }
            println!("assistant (spoken): {text}");
            *replying = false;
        }
        ConversationEvent::Notice(message) => {
            *replying = false;
            println!("! {message}");
        }
    }
}

/// Reload settings whenever the config file's modification time changes
async fn watch_config(settings: Settings, no_stream: bool, cancel: CancellationToken) {
    let Some(path) = config_file_path() else {
        return;
    };

    let modified = |path: &std::path::Path| -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    };

    let mut last = modified(&path);
    let mut ticker = tokio::time::interval(CONFIG_POLL_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let current = modified(&path);
        if current != last {
            tracing::debug!(path = %path.display(), "config file changed");
            last = current;
            settings.reload();
            apply_overrides(&settings, no_stream);
        }
    }
}

/// One text turn: stream, resolve directives, print
async fn ask(settings: &Settings, text: &str) -> anyhow::Result<()> {
    let chat = ChatClient::new(settings.clone());
    let turn = ConversationTurn::user(text);
    let cancel = CancellationToken::new();

    let raw = if settings.snapshot().chat.stream {
        let reply = chat
            .stream(&[], &turn, &cancel, |chunk| {
                print!("{chunk}");
                let _ = std::io::stdout().flush();
            })
            .await;
        println!();
        match reply {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(kind = %e.kind(), error = %e, "stream failed, retrying in batch mode");
                chat.send(&[], &turn, &cancel).await?
            }
        }
    } else {
        let text = chat.send(&[], &turn, &cancel).await?;
        println!("{text}");
        text
    };

    let executor = ChainExecutor::standard(settings.clone());
    let resolved = actions::resolve(&raw, &executor).await;
    if resolved != raw {
        println!("---\n{resolved}");
    }

    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mic = Microphone::new(CpalSource::new());
    let mut lease = mic.claim(MicUse::Capture)?;
    let mut buffers = lease
        .take_receiver()
        .ok_or_else(|| anyhow::anyhow!("microphone stream unavailable"))?;

    let meter = AudioLevelMeter::default();
    println!("Sample rate: {} Hz", CpalSource::new().sample_rate());
    println!("---");

    for i in 0..duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut window: Vec<f32> = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, buffers.recv()).await {
                Ok(Some(MicEvent::Samples(samples))) => window.extend_from_slice(&samples),
                Ok(Some(MicEvent::Failed(message))) => anyhow::bail!("microphone failed: {message}"),
                Ok(None) => anyhow::bail!("microphone stream closed"),
                Err(_) => break,
            }
        }

        let rms = calculate_rms(&window);
        let level = meter.level(&window);
        let peak = window.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (level * 50.0).min(50.0) as usize;
        let bar: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Level: {:.2} | Peak: {:.4} | [{}]",
            i + 1,
            rms,
            level,
            peak,
            bar
        );
    }

    drop(buffers);
    drop(lease);

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the level stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let samples = tone(440.0, Duration::from_secs(2), 0.3);
    println!(
        "Playing {} samples at {} Hz...",
        samples.len(),
        PLAYBACK_SAMPLE_RATE
    );

    tokio::task::spawn_blocking(move || {
        let stop = AtomicBool::new(false);
        AudioPlayback::new()?.play_blocking(samples, &stop)
    })
    .await??;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Speak text through the configured TTS provider
async fn test_tts(settings: &Settings, text: &str) -> anyhow::Result<()> {
    let text = normalize_for_speech(text);
    println!("Testing TTS with text: \"{text}\"\n");

    let synth = CloudSynthesizer::new(settings.clone());
    let params = VoiceParams::from(&settings.snapshot().voice);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    println!("Synthesizing speech...");
    synth
        .speak(&text, &params, events_tx, CancellationToken::new())
        .await?;

    while let Ok(event) = events_rx.try_recv() {
        match event {
            TtsEvent::Started => println!("Playing..."),
            TtsEvent::Finished => println!("Done!"),
            TtsEvent::Cancelled => println!("Cancelled"),
        }
    }

    Ok(())
}
