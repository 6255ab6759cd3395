// apps/session-sim/src/script.rs
use serde::{Deserialize, Serialize};
use std::path::Path;

use video_session_cell::SessionCommand;

/// What the simulated remote peer does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PeerAction {
    RemoteStream,
    Disconnect,
    Reconnect,
    HangUp,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptStep {
    /// A UI command sent to the coordinator.
    Command { command: SessionCommand },
    Peer { action: PeerAction },
    /// Queue transport readings as `[rtt_ms, loss_ratio, jitter_ms]`.
    Stats { readings: Vec<(f64, f64, f64)> },
    /// The user presses the OS "stop sharing" button.
    EndDisplayCapture,
    DevicesChanged,
    Wait { ms: u64 },
}

pub const DEFAULT_SCRIPT: &str = r#"[
  { "step": "stats", "readings": [[60, 0.0, 4], [70, 0.001, 6], [260, 0.03, 35], [280, 0.03, 40]] },
  { "step": "command", "command": {
      "command": "start_session",
      "participant": { "id": "6f1c1a52-8a3e-4c55-9b0e-0c2f5d4b7a10", "participant_type": "doctor", "display_name": "Dr. Rivera" }
  } },
  { "step": "wait", "ms": 200 },
  { "step": "command", "command": { "command": "toggle_mute" } },
  { "step": "command", "command": { "command": "start_recording", "consent": false } },
  { "step": "command", "command": { "command": "start_recording", "consent": true } },
  { "step": "command", "command": { "command": "start_screen_share" } },
  { "step": "wait", "ms": 4500 },
  { "step": "end_display_capture" },
  { "step": "command", "command": { "command": "switch_device", "kind": "camera", "device_id": "camera-usb" } },
  { "step": "command", "command": { "command": "pause_recording" } },
  { "step": "command", "command": { "command": "resume_recording" } },
  { "step": "wait", "ms": 4500 },
  { "step": "peer", "action": "disconnect" },
  { "step": "wait", "ms": 1500 },
  { "step": "peer", "action": "reconnect" },
  { "step": "wait", "ms": 200 },
  { "step": "command", "command": { "command": "end_session" } }
]"#;

pub fn parse(source: &str) -> Result<Vec<ScriptStep>, serde_json::Error> {
    serde_json::from_str(source)
}

pub fn load(path: &Path) -> anyhow::Result<Vec<ScriptStep>> {
    let source = std::fs::read_to_string(path)?;
    Ok(parse(&source)?)
}
