//! Terminal host for the turn engine.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (default on first run).
//! 3. Build the collaborators: cpal capture and output, transcription,
//!    replies and speech synthesis.
//! 4. Print microphone changes from a [`Subscription`] and the processing
//!    stages from the event stream.
//! 5. Read commands from stdin until `q` or EOF.
//!
//! # Commands
//!
//! | input   | action                              |
//! |---------|-------------------------------------|
//! | Enter   | start a turn                        |
//! | `s`     | stop recording now                  |
//! | `c`     | cancel the current turn             |
//! | `clear` | forget the conversation so far      |
//! | `q`     | quit                                |

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use voice_turn::{
    audio::{CpalCapture, CpalOutput},
    config::AppConfig,
    llm::ChatCompletionResponder,
    pipeline::{Collaborators, Subscription, TurnEngine, TurnError, TurnEvent, TurnOutcome},
    stt::{OpenAiTranscriber, Transcriber},
    tts::OpenAiSynthesizer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("voice-turn starting up");

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });
    if config.openai.resolved_api_key().is_none() {
        bail!("no API key: set `openai.api_key` in settings.toml or OPENAI_API_KEY");
    }

    // 3. Collaborators
    let engine = TurnEngine::new(
        config.engine.clone(),
        &config.persona.system_prompt,
        Collaborators {
            capture: Arc::new(CpalCapture::new(&config.engine.vad)),
            output: Arc::new(CpalOutput::new()),
            transcriber: build_transcriber(&config),
            responder: Arc::new(ChatCompletionResponder::from_config(
                &config.openai,
                &config.persona,
            )),
            synthesizer: Arc::new(OpenAiSynthesizer::from_config(&config.openai)),
        },
    );

    // 4. Microphone indicator
    let _indicator: Subscription = engine.on_recording_change(|recording| {
        if recording {
            println!("[mic on] speak now; pause to finish");
        } else {
            println!("[mic off]");
        }
    });

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TurnEvent::StateChanged { to, .. }) if to.is_busy() && !to.is_recording() => {
                    println!("[{}]", to.label());
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    // 5. Command loop
    println!("Enter = talk, s = stop, c = cancel, clear = new conversation, q = quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match line.trim() {
            "" => {
                let engine = engine.clone();
                let name = config.persona.name.clone();
                tokio::spawn(async move { report(&name, engine.start_turn().await) });
            }
            "s" => engine.stop_turn_manually(),
            "c" => engine.cancel_turn(),
            "clear" => {
                engine.clear_history();
                println!("conversation cleared");
            }
            "q" => break,
            other => println!("unknown command: {other}"),
        }
    }

    engine.cancel_turn();
    log::info!("voice-turn shutting down");
    Ok(())
}

fn report(name: &str, outcome: Result<TurnOutcome, TurnError>) {
    match outcome {
        Ok(TurnOutcome::Completed(turn)) => {
            println!("you: {}", turn.transcription);
            println!("{name}: {}", turn.reply_text);
        }
        Ok(TurnOutcome::NoSpeech) => println!("(didn't catch that)"),
        Ok(TurnOutcome::Cancelled) => println!("(cancelled)"),
        Err(TurnError::AlreadyInProgress) => println!("(still busy with the last turn)"),
        Err(e) => eprintln!("turn failed: {e}"),
    }
}

#[cfg(feature = "local-whisper")]
fn build_transcriber(config: &AppConfig) -> Arc<dyn Transcriber> {
    use voice_turn::{config::AppPaths, stt::WhisperTranscriber};

    let model = AppPaths::new().models_dir.join("ggml-base.bin");
    match WhisperTranscriber::load(&model, config.openai.language.clone()) {
        Ok(whisper) => {
            log::info!("Whisper model loaded: {}", model.display());
            Arc::new(whisper)
        }
        Err(e) => {
            log::warn!("Could not load Whisper model ({e}); using the transcription API");
            Arc::new(OpenAiTranscriber::from_config(&config.openai))
        }
    }
}

#[cfg(not(feature = "local-whisper"))]
fn build_transcriber(config: &AppConfig) -> Arc<dyn Transcriber> {
    Arc::new(OpenAiTranscriber::from_config(&config.openai))
}
