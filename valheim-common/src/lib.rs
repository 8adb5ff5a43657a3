// Copyright (C) 2026 ValheimDiscord
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discord interaction type codes (the `type` field of the inbound payload).
pub const INTERACTION_TYPE_PING: u8 = 1;
pub const INTERACTION_TYPE_APPLICATION_COMMAND: u8 = 2;

/// Discord interaction callback type codes (the `type` field of the reply).
pub const CALLBACK_TYPE_PONG: u8 = 1;
pub const CALLBACK_TYPE_CHANNEL_MESSAGE_WITH_SOURCE: u8 = 4;

/// Message flag marking a callback as visible only to the invoking user.
pub const MESSAGE_FLAG_EPHEMERAL: u64 = 64;

/// The one slash command this backend recognizes.
pub const SERVER_COMMAND: &str = "valheim";

/// Username attached to broadcast webhook messages.
pub const WEBHOOK_USERNAME: &str = "valheimbot";

pub const FAILED_MESSAGE: &str = "Something broke and I couldn't get to the server :(";
pub const UNRECOGNIZED_MESSAGE: &str = "I don't recognize your command :(";

/// An inbound interaction event from Discord. Only the fields this backend
/// routes on are decoded; everything else in the payload is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Interaction {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub data: Option<CommandData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandData {
    pub name: String,
    #[serde(default)]
    pub options: Vec<CommandOption>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandOption {
    pub name: String,
}

impl CommandData {
    /// Name of the first sub-option, or empty if the command carried none.
    pub fn sub_option(&self) -> &str {
        self.options.first().map(|o| o.name.as_str()).unwrap_or("")
    }
}

/// Coarse lifecycle state of the compute instance. Anything outside the
/// three states the bot acts on collapses into `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Stopping,
    Terminated,
    Other,
}

impl InstanceState {
    pub fn from_status(status: &str) -> Self {
        match status {
            "RUNNING" => InstanceState::Running,
            "STOPPING" => InstanceState::Stopping,
            "TERMINATED" => InstanceState::Terminated,
            _ => InstanceState::Other,
        }
    }
}

/// Point-in-time view of the compute instance, decoded from the GCP
/// Compute v1 instance resource.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_start_timestamp: Option<String>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
    #[serde(default, rename = "natIP")]
    pub nat_ip: Option<String>,
}

impl InstanceSnapshot {
    pub fn state(&self) -> InstanceState {
        self.status
            .as_deref()
            .map(InstanceState::from_status)
            .unwrap_or(InstanceState::Other)
    }

    /// First external (NAT) address across all interfaces, if any.
    pub fn external_ip(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|interface| &interface.access_configs)
            .find_map(|access| access.nat_ip.as_deref())
    }
}

/// Body of the game server's embedded `/status.json` endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default)]
    pub player_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the command executor hands to the response dispatcher: the reply
/// text plus whether it should also go out on the shared webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub message: String,
    pub broadcast: bool,
}

impl CommandResult {
    pub fn private(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            broadcast: false,
        }
    }

    pub fn broadcast(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            broadcast: true,
        }
    }
}

pub fn status_line(state: InstanceState) -> &'static str {
    match state {
        InstanceState::Running => "The server is running!",
        InstanceState::Stopping => "The server is shutting down...",
        InstanceState::Terminated => "The server is shut down.",
        InstanceState::Other => "The server is in a mysterious state.",
    }
}

/// Uptime phrase from the instance's RFC 3339 last-start timestamp,
/// truncated to whole minutes.
pub fn uptime_phrase(
    last_start_timestamp: &str,
    now: DateTime<Utc>,
) -> Result<String, chrono::ParseError> {
    let started_at = DateTime::parse_from_rfc3339(last_start_timestamp)?.with_timezone(&Utc);
    let minutes = now.signed_duration_since(started_at).num_minutes().max(0);
    if minutes < 60 {
        Ok(format!("It has been up for {minutes}m."))
    } else {
        Ok(format!(
            "It has been up for {}h{}m.",
            minutes / 60,
            minutes % 60
        ))
    }
}

pub fn player_count_phrase(player_count: u32) -> String {
    match player_count {
        0 => "There's no one playing.".to_string(),
        1 => "There's 1 person online. They're probably lonely, go join them!".to_string(),
        n => format!("There's {n} people online."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn instance_state_parses_known_statuses() {
        assert_eq!(InstanceState::from_status("RUNNING"), InstanceState::Running);
        assert_eq!(
            InstanceState::from_status("STOPPING"),
            InstanceState::Stopping
        );
        assert_eq!(
            InstanceState::from_status("TERMINATED"),
            InstanceState::Terminated
        );
    }

    #[test]
    fn instance_state_collapses_unknown_statuses_to_other() {
        for status in ["PROVISIONING", "STAGING", "SUSPENDED", "REPAIRING", ""] {
            assert_eq!(InstanceState::from_status(status), InstanceState::Other);
        }
    }

    #[test]
    fn snapshot_without_status_is_other() {
        let snapshot = InstanceSnapshot::default();
        assert_eq!(snapshot.state(), InstanceState::Other);
    }

    #[test]
    fn status_line_covers_every_state() {
        assert_eq!(
            status_line(InstanceState::Running),
            "The server is running!"
        );
        assert_eq!(
            status_line(InstanceState::Stopping),
            "The server is shutting down..."
        );
        assert_eq!(
            status_line(InstanceState::Terminated),
            "The server is shut down."
        );
        assert_eq!(
            status_line(InstanceState::Other),
            "The server is in a mysterious state."
        );
    }

    #[test]
    fn uptime_phrase_truncates_to_whole_minutes() {
        let now = Utc.with_ymd_and_hms(2026, 2, 7, 12, 30, 45).unwrap();
        let phrase = uptime_phrase("2026-02-07T10:05:10Z", now).unwrap();
        assert_eq!(phrase, "It has been up for 2h25m.");
    }

    #[test]
    fn uptime_phrase_under_an_hour_omits_hours() {
        let now = Utc.with_ymd_and_hms(2026, 2, 7, 12, 30, 0).unwrap();
        let phrase = uptime_phrase("2026-02-07T12:05:00Z", now).unwrap();
        assert_eq!(phrase, "It has been up for 25m.");
    }

    #[test]
    fn uptime_phrase_accepts_offset_timestamps() {
        let now = Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).unwrap();
        let phrase = uptime_phrase("2026-02-07T10:00:00-01:00", now).unwrap();
        assert_eq!(phrase, "It has been up for 1h0m.");
    }

    #[test]
    fn uptime_phrase_rejects_garbage_timestamps() {
        assert!(uptime_phrase("not-a-timestamp", Utc::now()).is_err());
    }

    #[test]
    fn uptime_phrase_clamps_future_start_to_zero() {
        let now = Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).unwrap();
        let phrase = uptime_phrase("2026-02-07T13:00:00Z", now).unwrap();
        assert_eq!(phrase, "It has been up for 0m.");
    }

    #[test]
    fn player_count_phrases() {
        assert_eq!(player_count_phrase(0), "There's no one playing.");
        assert_eq!(
            player_count_phrase(1),
            "There's 1 person online. They're probably lonely, go join them!"
        );
        assert_eq!(player_count_phrase(7), "There's 7 people online.");
    }

    #[test]
    fn interaction_decodes_application_command() {
        let payload = serde_json::json!({
            "type": 2,
            "data": {
                "name": "valheim",
                "options": [{"name": "status"}]
            }
        });
        let interaction: Interaction = serde_json::from_value(payload).unwrap();
        assert_eq!(interaction.kind, INTERACTION_TYPE_APPLICATION_COMMAND);
        let data = interaction.data.unwrap();
        assert_eq!(data.name, SERVER_COMMAND);
        assert_eq!(data.sub_option(), "status");
    }

    #[test]
    fn interaction_decodes_ping_without_data() {
        let interaction: Interaction = serde_json::from_value(serde_json::json!({"type": 1})).unwrap();
        assert_eq!(interaction.kind, INTERACTION_TYPE_PING);
        assert!(interaction.data.is_none());
    }

    #[test]
    fn command_without_options_has_empty_sub_option() {
        let data = CommandData {
            name: SERVER_COMMAND.to_string(),
            options: vec![],
        };
        assert_eq!(data.sub_option(), "");
    }

    #[test]
    fn snapshot_decodes_gcp_instance_resource() {
        let payload = serde_json::json!({
            "status": "RUNNING",
            "lastStartTimestamp": "2026-02-07T10:00:00Z",
            "networkInterfaces": [
                {"accessConfigs": []},
                {"accessConfigs": [{"natIP": "203.0.113.9"}]}
            ]
        });
        let snapshot: InstanceSnapshot = serde_json::from_value(payload).unwrap();
        assert_eq!(snapshot.state(), InstanceState::Running);
        assert_eq!(
            snapshot.last_start_timestamp.as_deref(),
            Some("2026-02-07T10:00:00Z")
        );
        assert_eq!(snapshot.external_ip(), Some("203.0.113.9"));
    }

    #[test]
    fn snapshot_without_nat_ip_has_no_external_ip() {
        let payload = serde_json::json!({
            "status": "RUNNING",
            "networkInterfaces": [{"accessConfigs": [{}]}]
        });
        let snapshot: InstanceSnapshot = serde_json::from_value(payload).unwrap();
        assert_eq!(snapshot.external_ip(), None);
    }

    #[test]
    fn player_status_decodes_with_missing_fields() {
        let status: PlayerStatus = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(status.player_count, 0);
        assert!(status.server_name.is_none());

        let status: PlayerStatus = serde_json::from_value(serde_json::json!({
            "server_name": "Midgard",
            "player_count": 3
        }))
        .unwrap();
        assert_eq!(status.player_count, 3);
        assert_eq!(status.server_name.as_deref(), Some("Midgard"));
    }

    #[test]
    fn command_result_constructors_set_broadcast_flag() {
        assert!(!CommandResult::private("hi").broadcast);
        assert!(CommandResult::broadcast("hi").broadcast);
    }
}
