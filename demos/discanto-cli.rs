use clap::Parser;
use colored::Colorize;
use discanto::{AudioInput, Config, Discanto, VoiceChannelEvent};
use std::sync::Arc;
use tokio::signal;

/// Join a discord voice channel, optionally say something, and print
/// everything we hear.
#[derive(clap::Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Guild ID to connect to
    #[arg(short, long)]
    guild_id: u64,
    /// Channel ID to connect to
    #[arg(short, long)]
    channel_id: u64,
    /// Text to speak after joining (needs a configured voice)
    #[arg(short, long)]
    say: Option<String>,
    /// Raw 48kHz s16le stereo PCM file to play after joining
    #[arg(short, long)]
    play_pcm: Option<String>,
}

fn on_event(event: VoiceChannelEvent) {
    match event {
        VoiceChannelEvent::Connect(status) => {
            println!(
                "Connection status: {} to channel #{} via {}",
                "connected".bright_green(),
                status.channel_id,
                status.endpoint
            );
        }
        VoiceChannelEvent::Disconnect { guild_id } => {
            println!(
                "Connection status: {} (guild {})",
                "disconnected".bright_red(),
                guild_id
            );
        }
        VoiceChannelEvent::SpeakingStateChange { user_id, speaking } => {
            println!(
                "User {} {}",
                user_id,
                if speaking {
                    "started talking".bright_green()
                } else {
                    "stopped talking".bright_purple()
                }
            );
        }
        VoiceChannelEvent::Transcription(entry) => {
            println!("{} says: {}", entry.username.bright_green(), entry.text.bold());
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_max_level(config.log_level())
        .init();

    let client = match Discanto::connect(config, Arc::new(on_event)).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("cannot connect: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = client.join_voice(cli.guild_id, cli.channel_id).await {
        eprintln!("cannot join voice: {}", e);
        client.close().await;
        std::process::exit(1);
    }
    println!("Joined voice channel");

    if let Some(text) = cli.say {
        if let Err(e) = client.say(&text).await {
            eprintln!("say failed: {}", e);
        }
    }
    if let Some(path) = cli.play_pcm {
        match std::fs::read(&path) {
            Ok(pcm) => {
                if let Err(e) = client.play_audio(AudioInput::Pcm(pcm)).await {
                    eprintln!("playback failed: {}", e);
                }
            }
            Err(e) => eprintln!("cannot read {}: {}", path, e),
        }
    }

    signal::ctrl_c().await.unwrap();
    println!("\nTranscript:");
    for entry in client.get_transcript(None) {
        println!("  [{}] {}: {}", entry.timestamp, entry.username, entry.text);
    }
    client.close().await;
}
