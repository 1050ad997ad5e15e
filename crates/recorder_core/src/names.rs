//! Default titles for assignments created when recording starts.

use chrono::{DateTime, Local, Utc};
use rand::seq::IndexedRandom;
use shared::domain::NewAssignment;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "daring", "eager", "faded", "gentle", "hidden", "idle", "jolly",
    "keen", "lucky", "misty", "nimble", "odd", "plain", "quiet", "rapid", "silent", "tidy",
    "upbeat", "vivid", "wandering", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "canyon", "delta", "ember", "falcon", "glacier", "harbor", "island", "juniper",
    "kestrel", "lantern", "meadow", "nebula", "orchard", "pebble", "quarry", "river", "summit",
    "thicket", "upland", "valley", "willow", "yarrow", "zephyr", "trail",
];

/// Two lowercase words separated by a space, e.g. `"quiet falcon"`.
pub fn random_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("trail");
    format!("{adjective} {noun}")
}

/// The description carries the creation date in the local time zone.
pub fn untitled_assignment(created_at: DateTime<Utc>) -> NewAssignment {
    let local_date = created_at.with_timezone(&Local).format("%a %b %d %Y");
    NewAssignment {
        title: format!("Untitled ({})", random_name()),
        description: format!("Created {local_date}"),
        created_at,
    }
}
