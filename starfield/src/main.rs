//! Simulate several participants sharing one in-process backend.
//!
//! Each simulated participant runs a full client loop. The run creates a
//! small room that is deliberately too small for everyone, exchanges a few
//! follows and messages, lets positions drift, then signs everyone out and
//! logs whether occupant counts converged to the membership rows.
#![cfg_attr(not(any(test, doctest)), deny(clippy::unwrap_used))]
#![cfg_attr(not(any(test, doctest)), deny(clippy::expect_used))]

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr, eyre};
use mockable::{Clock, DefaultClock};
use ortho_config::OrthoConfig;
use serde_json::Value;
use starfield::domain::ports::Table;
use starfield::outbound::memory::{InMemoryBackend, MemoryIdentityProvider, MemoryStoreClient};
use starfield::{ClientHandle, ClientParts, ClientSettings, StarfieldClient};
use tokio::runtime::Builder;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// `starfield-simulate` command arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "starfield-simulate",
    about = "Run simulated participants against an in-process backend",
    version
)]
struct CliArgs {
    /// Number of simulated participants.
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(2..=64))]
    participants: u32,
    /// How long to let the simulation run, in seconds.
    #[arg(long, default_value_t = 10)]
    seconds: u64,
    /// Override the drift tick period in milliseconds.
    #[arg(long = "tick-ms", value_name = "ms")]
    tick_ms: Option<u64>,
}

struct Participant {
    handle: ClientHandle,
    identity: Arc<MemoryIdentityProvider>,
    task: JoinHandle<()>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    if let Err(e) = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .try_init()
    {
        warn!(error = %e, "tracing init failed");
    }

    let args = CliArgs::parse();
    let mut settings = ClientSettings::load_from_iter([OsString::from("starfield-simulate")])
        .map_err(|error| eyre!("load client settings: {error}"))?;
    if args.tick_ms.is_some() {
        settings.tick_interval_ms = args.tick_ms;
    }

    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err("create Tokio runtime")?;
    runtime.block_on(simulate(args, settings))
}

async fn simulate(args: CliArgs, settings: ClientSettings) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(DefaultClock);
    let backend = InMemoryBackend::new(Arc::clone(&clock));

    let mut participants = Vec::new();
    for index in 0..args.participants {
        let participant = spawn_participant(&backend, &clock, settings.clone());
        participant
            .identity
            .sign_in(&format!("star-{index}"))
            .map_err(|error| eyre!("sign in star-{index}: {error}"))?;
        participants.push(participant);
    }
    // Let every loop pick up its session.
    tokio::time::sleep(Duration::from_millis(200)).await;

    exercise_rooms(&participants, args.participants).await?;
    exercise_social(&participants).await;

    info!(seconds = args.seconds, "letting participants drift");
    tokio::time::sleep(Duration::from_secs(args.seconds)).await;

    for (index, participant) in participants.iter().enumerate() {
        let snapshot = participant
            .handle
            .snapshot()
            .await
            .map_err(|error| eyre!("snapshot: {error}"))?;
        let position = snapshot.state.participants.local().map(|p| p.position);
        info!(
            index,
            visible = snapshot.state.participants.len(),
            rooms = snapshot.state.rooms.rooms().len(),
            messages = snapshot.state.chat.len(),
            ?position,
            sync_error = ?snapshot.last_sync_error,
            "participant view"
        );
    }

    for participant in participants {
        match participant.handle.sign_out().await {
            Ok(report) => info!(failures = report.failures.len(), "signed out"),
            Err(error) => warn!(error = %error, "sign out failed"),
        }
        if let Err(error) = participant.handle.shutdown().await {
            warn!(error = %error, "shutdown failed");
        }
        participant
            .task
            .await
            .wrap_err("client task panicked")?;
    }

    report_convergence(&backend)
}

fn spawn_participant(
    backend: &InMemoryBackend,
    clock: &Arc<dyn Clock>,
    settings: ClientSettings,
) -> Participant {
    let identity = Arc::new(MemoryIdentityProvider::new(backend.clone(), Arc::clone(clock)));
    let (client, handle) = StarfieldClient::new(ClientParts {
        store: Arc::new(identity.session_store()),
        service: Arc::new(MemoryStoreClient::service(backend.clone())),
        identity: identity.clone(),
        clock: Arc::clone(clock),
        settings,
    });
    let task = tokio::spawn(client.run());
    Participant {
        handle,
        identity,
        task,
    }
}

/// The first participant opens a room one seat short of everyone; the rest
/// try to join and the last is turned away.
async fn exercise_rooms(participants: &[Participant], count: u32) -> Result<()> {
    let Some((host, guests)) = participants.split_first() else {
        return Ok(());
    };
    let room = host
        .handle
        .create_room("Lobby", Some(count.saturating_sub(1).max(1)))
        .await
        .map_err(|error| eyre!("create room: {error}"))?;
    info!(room_id = %room.id, capacity = room.capacity, "room opened");
    for guest in guests {
        match guest.handle.join_room(room.id).await {
            Ok(()) => info!(room_id = %room.id, "guest joined"),
            Err(error) => info!(code = ?error.code(), error = %error, "guest turned away"),
        }
    }
    if let Err(error) = host.handle.send_room("welcome aboard").await {
        warn!(error = %error, "room greeting failed");
    }
    Ok(())
}

/// Everyone follows the host; the host follows the first guest back.
async fn exercise_social(participants: &[Participant]) {
    let Some((host, guests)) = participants.split_first() else {
        return;
    };
    let Ok(Some(host_session)) = host.handle.snapshot().await.map(|s| s.session) else {
        return;
    };
    for guest in guests {
        if let Err(error) = guest.handle.follow(host_session.participant_id).await {
            warn!(error = %error, "follow failed");
        }
        if let Err(error) = guest.handle.send_public("hello, starfield").await {
            warn!(error = %error, "public message failed");
        }
    }
    if let Some(first) = guests.first()
        && let Ok(Some(guest_session)) = first.handle.snapshot().await.map(|s| s.session)
    {
        match host.handle.follow(guest_session.participant_id).await {
            Ok(mutual) => info!(mutual, "host followed back"),
            Err(error) => warn!(error = %error, "follow back failed"),
        }
    }
}

fn report_convergence(backend: &InMemoryBackend) -> Result<()> {
    let rooms = backend
        .dump(Table::Rooms)
        .map_err(|error| eyre!("read rooms: {error}"))?;
    let memberships = backend
        .dump(Table::Memberships)
        .map_err(|error| eyre!("read memberships: {error}"))?;
    let mut actual: HashMap<String, u64> = HashMap::new();
    for membership in &memberships {
        if let Some(room) = membership.get("room_id").and_then(Value::as_str) {
            *actual.entry(room.to_owned()).or_default() += 1;
        }
    }
    for room in &rooms {
        let id = room.get("id").and_then(Value::as_str).unwrap_or_default();
        let cached = room.get("occupant_count").and_then(Value::as_u64).unwrap_or_default();
        let real = actual.get(id).copied().unwrap_or_default();
        if cached == real {
            info!(room_id = id, occupants = real, "occupant count converged");
        } else {
            warn!(room_id = id, cached, real, "occupant count diverged");
        }
    }
    let participants = backend
        .dump(Table::Participants)
        .map_err(|error| eyre!("read participants: {error}"))?;
    let still_online = participants
        .iter()
        .filter(|row| row.get("online") == Some(&Value::Bool(true)))
        .count();
    info!(participants = participants.len(), still_online, "simulation finished");
    Ok(())
}
