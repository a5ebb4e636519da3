//! Recipient routing for chat and die-roll results.
//!
//! Exactly one mode applies to a message, checked in this order:
//!
//! | mode        | delivered to                                           |
//! |-------------|--------------------------------------------------------|
//! | `ToGM`      | GM sessions, and sessions of the sender                |
//! | `ToAll`     | every authenticated session                            |
//! | explicit    | sessions of the sender and of each listed recipient    |
//!
//! Clients that have not authenticated never receive routed messages.
//! The same rule decides what a reconnecting client gets back from the
//! chat history.

use std::sync::Arc;

use mapforge_protocol::{ChatCommon, DieDetail, DieRollResult, RollResultPayload};
use mapforge_session::{Client, Feature};

/// Title of a receipt for another player's secret roll.
pub const GENERIC_RECEIPT_TITLE: &str = "roll to GM";

/// Title of the placeholder sent to players when the GM rolls secretly.
pub const GM_SCREEN_TITLE: &str = "GM rolls behind screen";

/// Whether `client` may see a message addressed by `common`.
pub fn is_visible(client: &Client, common: &ChatCommon) -> bool {
    let Some(auth) = client.auth() else {
        tracing::debug!(client = %client.id(), "skipping unauthenticated client");
        return false;
    };
    if common.to_gm {
        auth.gm_mode || auth.username == common.sender
    } else if common.to_all {
        true
    } else {
        auth.username == common.sender || common.recipients.iter().any(|r| *r == auth.username)
    }
}

/// The clients in `peers` that receive a message addressed by `common`.
pub fn recipients(common: &ChatCommon, peers: &[Arc<Client>]) -> Vec<Arc<Client>> {
    peers
        .iter()
        .filter(|peer| is_visible(peer, common))
        .cloned()
        .collect()
}

/// Non-GM sessions that get a receipt instead of a secret roll: every
/// authenticated player except the roller's own sessions.
pub fn receipt_recipients(roller: &str, peers: &[Arc<Client>]) -> Vec<Arc<Client>> {
    peers
        .iter()
        .filter(|peer| {
            peer.auth()
                .is_some_and(|auth| !auth.gm_mode && auth.username != roller)
        })
        .cloned()
        .collect()
}

/// The redacted copy of a `ToGM` roll shown to `peer`.
///
/// A player's secret roll keeps its sender, so the table knows who
/// rolled; the title is shown only to clients that asked for labelled
/// dice. A GM's secret roll shows only that the GM rolled. The result
/// itself never appears in a receipt.
pub fn receipt_for(roll: &RollResultPayload, roller_is_gm: bool, peer: &Client) -> RollResultPayload {
    let title = if roller_is_gm {
        GM_SCREEN_TITLE.to_owned()
    } else if peer.features().has(Feature::DiceColorLabels) {
        roll.title.clone()
    } else {
        GENERIC_RECEIPT_TITLE.to_owned()
    };
    let note = if roller_is_gm { "hidden" } else { "sent to GM" };

    RollResultPayload {
        common: ChatCommon {
            recipients: Vec::new(),
            to_all: false,
            to_gm: false,
            ..roll.common.clone()
        },
        title,
        result: DieRollResult {
            result: 0,
            details: vec![DieDetail {
                kind: "comment".into(),
                value: note.into(),
            }],
            invalid_request: false,
        },
        request_id: String::new(),
        more_results: roll.more_results,
    }
}
