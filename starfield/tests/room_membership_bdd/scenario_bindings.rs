//! Scenario bindings for room membership BDD tests.

use rstest_bdd_macros::scenario;

use crate::{RoomMembershipWorld, world};

#[scenario(
    path = "tests/features/room_membership.feature",
    name = "A full room turns away the next participant"
)]
fn a_full_room_turns_away_the_next_participant(world: RoomMembershipWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/room_membership.feature",
    name = "Joining another room moves the membership"
)]
fn joining_another_room_moves_the_membership(world: RoomMembershipWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/room_membership.feature",
    name = "A banned participant stays out until the ban is lifted"
)]
fn a_banned_participant_stays_out_until_the_ban_is_lifted(world: RoomMembershipWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/room_membership.feature",
    name = "Handing over a room leaves its occupants alone"
)]
fn handing_over_a_room_leaves_its_occupants_alone(world: RoomMembershipWorld) {
    drop(world);
}
