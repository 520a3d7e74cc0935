//! Membership properties checked over randomised operation histories.
//!
//! Several clients share one in-memory backend. Each history is driven by a
//! seeded generator so a failing seed can be replayed.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;
use serde_json::{Value, json};
use starfield::domain::ports::Table;
use starfield::domain::{ErrorCode, ParticipantId, RoomId, SignOutStep};
use starfield::test_support::{TestClient, TestWorld, quiet_settings};

mod support;

const CROWD: [&str; 5] = ["ara", "bellatrix", "capella", "deneb", "electra"];

async fn crowd(world: &TestWorld, size: usize) -> Vec<(TestClient, ParticipantId)> {
    let mut clients = Vec::new();
    for name in CROWD.iter().take(size) {
        let mut client = world.client(quiet_settings());
        let session = client.sign_in(name).await;
        clients.push((client, session.participant_id));
    }
    clients
}

async fn stop_all(clients: Vec<(TestClient, ParticipantId)>) {
    for (client, _) in clients {
        client.stop().await;
    }
}

fn assert_single_rooms(world: &TestWorld) {
    let mut seen = BTreeSet::new();
    for (participant, room) in support::membership_pairs(&world.backend) {
        assert!(
            seen.insert(participant),
            "{participant} holds a second membership in {room}"
        );
    }
}

fn assert_counts_converged(world: &TestWorld) {
    for room in support::room_rows(&world.backend) {
        let (cached, actual) = support::occupancy(&world.backend, room.id);
        assert_eq!(
            usize::try_from(cached).expect("count fits"),
            actual,
            "room {} cached {cached} but has {actual} members",
            room.name
        );
    }
}

#[rstest]
#[case(7)]
#[case(42)]
#[case(2026)]
#[tokio::test]
async fn random_histories_keep_one_room_each_and_settle_counts(#[case] seed: u64) {
    let world = TestWorld::new();
    let clients = crowd(&world, 5).await;
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut rooms: Vec<RoomId> = Vec::new();

    for step in 0..40 {
        let actor = rng.gen_range(0..clients.len());
        let Some((client, _)) = clients.get(actor) else {
            continue;
        };
        match rng.gen_range(0..10) {
            0 | 1 => {
                let capacity = rng.gen_range(1..=3);
                let name = format!("room {step}");
                if let Ok(room) = client.handle.create_room(&name, Some(capacity)).await {
                    rooms.push(room.id);
                }
            }
            2..=5 if !rooms.is_empty() => {
                let room = rooms.get(rng.gen_range(0..rooms.len())).copied();
                if let Some(room) = room {
                    let outcome = client.handle.join_room(room).await;
                    if let Err(error) = outcome {
                        assert_eq!(error.code(), ErrorCode::CapacityExceeded, "{error}");
                    }
                }
            }
            6 | 7 => {
                client.handle.leave_room().await.expect("leave never fails here");
            }
            _ => {
                let target = rng.gen_range(0..clients.len());
                if let Some((_, target)) = clients.get(target) {
                    // Fails unless the actor owns the room the target is in.
                    let outcome = client.handle.kick(*target).await;
                    if let Err(error) = outcome {
                        assert_ne!(error.code(), ErrorCode::TransientRemoteFailure, "{error}");
                    }
                }
            }
        }
        assert_single_rooms(&world);
    }

    assert_counts_converged(&world);
    stop_all(clients).await;
}

#[derive(Debug, Clone, Copy)]
enum Move {
    Create(u32),
    Join(RoomId),
    Leave,
    Kick(ParticipantId),
}

fn pick_move(rng: &mut SmallRng, rooms: &[RoomId], people: &[ParticipantId]) -> Move {
    let room = rooms.get(rng.gen_range(0..rooms.len().max(1))).copied();
    let target = people.get(rng.gen_range(0..people.len())).copied();
    match (rng.gen_range(0..10), room, target) {
        (0 | 1, _, _) | (2..=5, None, _) => Move::Create(rng.gen_range(1..=3)),
        (2..=5, Some(room), _) => Move::Join(room),
        (8 | 9, _, Some(target)) => Move::Kick(target),
        _ => Move::Leave,
    }
}

/// Run one move and return the room it created, if any.
async fn perform(client: &TestClient, step: usize, chosen: Move) -> Option<RoomId> {
    match chosen {
        Move::Create(capacity) => {
            let name = format!("room {step}");
            let room = client.handle.create_room(&name, Some(capacity)).await;
            Some(room.expect("create never fails here").id)
        }
        Move::Join(room) => {
            // A client always leaves before it joins, so the store's
            // one-membership constraint must never be what stops a join.
            if let Err(error) = client.handle.join_room(room).await {
                assert_eq!(error.code(), ErrorCode::CapacityExceeded, "{error}");
            }
            None
        }
        Move::Leave => {
            client.handle.leave_room().await.expect("leave never fails here");
            None
        }
        Move::Kick(target) => {
            if let Err(error) = client.handle.kick(target).await {
                assert_ne!(error.code(), ErrorCode::TransientRemoteFailure, "{error}");
            }
            None
        }
    }
}

#[rstest]
#[case(3)]
#[case(19)]
#[case(777)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_moves_from_two_clients_settle_counts(#[case] seed: u64) {
    let world = TestWorld::new();
    let clients = crowd(&world, 4).await;
    let people: Vec<ParticipantId> = clients.iter().map(|(_, id)| *id).collect();
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut rooms: Vec<RoomId> = Vec::new();

    for step in 0..30 {
        let first = rng.gen_range(0..clients.len());
        let second = (first + rng.gen_range(1..clients.len())) % clients.len();
        let (Some((left, _)), Some((right, _))) = (clients.get(first), clients.get(second)) else {
            continue;
        };
        let left_move = pick_move(&mut rng, &rooms, &people);
        let right_move = pick_move(&mut rng, &rooms, &people);
        let (made_left, made_right) = tokio::join!(
            perform(left, step, left_move),
            perform(right, step + 1000, right_move),
        );
        rooms.extend(made_left.into_iter().chain(made_right));
        assert_single_rooms(&world);
    }

    // Counts may lag while recounts race; one refresh settles them.
    let Some((settler, _)) = clients.first() else {
        panic!("clients expected");
    };
    settler.handle.refresh().await.expect("refresh");
    assert_counts_converged(&world);
    stop_all(clients).await;
}

#[rstest]
#[tokio::test]
async fn a_ban_holds_until_it_is_lifted() {
    let world = TestWorld::new();
    let clients = crowd(&world, 2).await;
    let [(owner, _), (guest, guest_id)] = clients.as_slice() else {
        panic!("two clients expected");
    };

    let room = owner.handle.create_room("Vault", Some(4)).await.expect("create");
    guest.handle.join_room(room.id).await.expect("join");
    let ban = owner.handle.ban(*guest_id, None).await.expect("ban");
    assert_eq!(support::occupancy(&world.backend, room.id), (1, 1));

    // Wandering elsewhere does not wear the ban off.
    guest.handle.create_room("Elsewhere", Some(2)).await.expect("create elsewhere");
    for _ in 0..3 {
        let error = guest.handle.join_room(room.id).await.expect_err("banned");
        assert_eq!(error.code(), ErrorCode::PermissionDenied);
    }
    let bans = owner.handle.bans(room.id).await.expect("bans");
    assert_eq!(bans.len(), 1);

    let refused = guest.handle.unban(ban.id).await.expect_err("not the owner");
    assert_eq!(refused.code(), ErrorCode::PermissionDenied);
    owner.handle.unban(ban.id).await.expect("unban");
    guest.handle.join_room(room.id).await.expect("join after unban");
    assert_eq!(support::occupancy(&world.backend, room.id), (2, 2));
    assert_single_rooms(&world);
    stop_all(clients).await;
}

#[rstest]
#[tokio::test]
async fn transfer_leaves_counts_and_memberships_untouched() {
    let world = TestWorld::new();
    let clients = crowd(&world, 3).await;
    let [(owner, owner_id), (heir, heir_id), (guest, _)] = clients.as_slice() else {
        panic!("three clients expected");
    };

    let room = owner.handle.create_room("Throne", Some(5)).await.expect("create");
    heir.handle.join_room(room.id).await.expect("heir joins");
    guest.handle.join_room(room.id).await.expect("guest joins");
    let before_members = support::membership_pairs(&world.backend);
    let before_count = support::occupancy(&world.backend, room.id);

    owner.handle.transfer_ownership(*heir_id).await.expect("transfer");

    assert_eq!(support::membership_pairs(&world.backend), before_members);
    assert_eq!(support::occupancy(&world.backend, room.id), before_count);
    let rows = support::room_rows(&world.backend);
    let stored = rows.iter().find(|r| r.id == room.id).expect("room row");
    assert_eq!(stored.owner, *heir_id);

    // The previous owner lost moderation rights.
    let error = owner.handle.kick(*heir_id).await.expect_err("no longer owner");
    assert_eq!(error.code(), ErrorCode::PermissionDenied);
    assert_ne!(stored.owner, *owner_id);
    stop_all(clients).await;
}

#[rstest]
#[tokio::test]
async fn everyone_goes_offline_even_with_dead_credentials() {
    let world = TestWorld::new();
    let clients = crowd(&world, 3).await;
    let Some((host, _)) = clients.first() else {
        panic!("clients expected");
    };
    let room = host.handle.create_room("Last Call", Some(5)).await.expect("create");
    for (client, _) in clients.iter().skip(1) {
        client.handle.join_room(room.id).await.expect("join");
    }

    for (client, _) in &clients {
        client.identity.expire_session().expect("expire");
        let report = client.handle.sign_out().await.expect("sign out");
        assert!(report.completed.contains(&SignOutStep::MarkOffline));
    }

    let online: BTreeMap<String, Value> = world
        .backend
        .dump(Table::Participants)
        .expect("dump participants")
        .into_iter()
        .map(|row| {
            let handle = row
                .get("handle")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            (handle, row.get("online").cloned().unwrap_or(Value::Null))
        })
        .collect();
    assert_eq!(online.len(), 3);
    assert!(online.values().all(|value| *value == json!(false)), "{online:?}");
    stop_all(clients).await;
}
