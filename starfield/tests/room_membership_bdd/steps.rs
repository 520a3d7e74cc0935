//! Step definitions for room membership BDD tests.

use rstest_bdd_macros::{given, then, when};
use starfield::domain::{Affiliation, ErrorCode};

use crate::RoomMembershipWorld;

#[given("signed-in participants alpha, beta and gamma")]
fn signed_in_participants_alpha_beta_and_gamma(world: &RoomMembershipWorld) {
    world.sign_in_all(&["alpha", "beta", "gamma"]);
}

#[given("alpha opens a room for two")]
fn alpha_opens_a_room_for_two(world: &RoomMembershipWorld) {
    world.open_room("alpha", 2);
}

#[given("beta opens a room for two")]
fn beta_opens_a_room_for_two(world: &RoomMembershipWorld) {
    world.open_room("beta", 2);
}

#[given("beta joins alpha's room")]
fn beta_has_joined_alphas_room(world: &RoomMembershipWorld) {
    world.join("beta", "alpha");
}

#[when("beta joins alpha's room")]
fn beta_joins_alphas_room(world: &RoomMembershipWorld) {
    world.join("beta", "alpha");
}

#[when("gamma tries to join alpha's room")]
fn gamma_tries_to_join_alphas_room(world: &RoomMembershipWorld) {
    world.attempt_join("gamma", "alpha");
}

#[when("beta tries to join alpha's room")]
fn beta_tries_to_join_alphas_room(world: &RoomMembershipWorld) {
    world.attempt_join("beta", "alpha");
}

#[when("alpha joins beta's room")]
fn alpha_joins_betas_room(world: &RoomMembershipWorld) {
    world.join("alpha", "beta");
}

#[when("alpha bans beta")]
fn alpha_bans_beta(world: &RoomMembershipWorld) {
    let alpha = world.member("alpha");
    let beta = world.participant("beta");
    let ban = world
        .block_on(alpha.client.handle.ban(beta, Some("testing".to_owned())))
        .expect("ban should succeed");
    world.last_ban.set(ban);
}

#[when("alpha lifts the ban")]
fn alpha_lifts_the_ban(world: &RoomMembershipWorld) {
    let alpha = world.member("alpha");
    let ban = world.last_ban.get().expect("a ban should be recorded");
    world
        .block_on(alpha.client.handle.unban(ban.id))
        .expect("unban should succeed");
}

#[when("alpha hands the room to beta")]
fn alpha_hands_the_room_to_beta(world: &RoomMembershipWorld) {
    let alpha = world.member("alpha");
    let beta = world.participant("beta");
    world
        .block_on(alpha.client.handle.transfer_ownership(beta))
        .expect("transfer should succeed");
}

#[then("gamma is told the room is full")]
fn gamma_is_told_the_room_is_full(world: &RoomMembershipWorld) {
    assert_eq!(world.last_error().code(), ErrorCode::CapacityExceeded);
    assert!(world.rooms_joined_by("gamma").is_empty());
}

#[then("beta is refused entry")]
fn beta_is_refused_entry(world: &RoomMembershipWorld) {
    assert_eq!(world.last_error().code(), ErrorCode::PermissionDenied);
    assert!(world.rooms_joined_by("beta").is_empty());
}

#[then("alpha's room holds two occupants")]
fn alphas_room_holds_two_occupants(world: &RoomMembershipWorld) {
    assert_eq!(world.occupancy(world.room_of("alpha")), (2, 2));
}

#[then("alpha's room holds one occupant")]
fn alphas_room_holds_one_occupant(world: &RoomMembershipWorld) {
    assert_eq!(world.occupancy(world.room_of("alpha")), (1, 1));
}

#[then("alpha's room holds no occupants")]
fn alphas_room_holds_no_occupants(world: &RoomMembershipWorld) {
    assert_eq!(world.occupancy(world.room_of("alpha")), (0, 0));
}

#[then("beta's room holds two occupants")]
fn betas_room_holds_two_occupants(world: &RoomMembershipWorld) {
    assert_eq!(world.occupancy(world.room_of("beta")), (2, 2));
}

#[then("alpha is a member of beta's room only")]
fn alpha_is_a_member_of_betas_room_only(world: &RoomMembershipWorld) {
    let room = world.room_of("beta");
    assert_eq!(world.rooms_joined_by("alpha"), vec![room]);
    let alpha = world.member("alpha");
    let snapshot = world.block_on(alpha.client.snapshot());
    assert_eq!(snapshot.state.rooms.affiliation(), Affiliation::Member(room));
}

#[then("alpha is a member of alpha's room only")]
fn alpha_is_a_member_of_alphas_room_only(world: &RoomMembershipWorld) {
    let room = world.room_of("alpha");
    assert_eq!(world.rooms_joined_by("alpha"), vec![room]);
}

#[then("a ban on beta is recorded for alpha's room")]
fn a_ban_on_beta_is_recorded_for_alphas_room(world: &RoomMembershipWorld) {
    let room = world.room_of("alpha");
    let alpha = world.member("alpha");
    let bans = world
        .block_on(alpha.client.handle.bans(room))
        .expect("bans should load");
    assert_eq!(bans.len(), 1);
    let ban = bans.first().expect("one ban");
    assert_eq!(ban.banned_id, world.participant("beta"));
    assert_eq!(ban.banned_by, world.participant("alpha"));
    assert_eq!(ban.reason.as_deref(), Some("testing"));
}

#[then("beta owns alpha's room")]
fn beta_owns_alphas_room(world: &RoomMembershipWorld) {
    let room = world.room_row(world.room_of("alpha"));
    assert_eq!(room.owner, world.participant("beta"));
}
