use std::sync::Arc;
use tauri::{AppHandle, Emitter, Runtime, State};

use crate::call::{
    AgentDescriptor, CallHandle, CallObserver, CallRecord, CallSession, CallUpdate, EntryPoint,
};
use crate::ivr::{HostSpeechPlayer, SpeechRequest, SpeechSink};
use crate::voices::{VoiceOption, VOICES};

/// Managed state holding the call controller handle
pub struct CallState {
    pub handle: CallHandle,
}

/// Forwards call updates to the web UI as `call-update` events
pub struct EventObserver<R: Runtime> {
    app: AppHandle<R>,
}

impl<R: Runtime> EventObserver<R> {
    pub fn new(app: AppHandle<R>) -> Self {
        Self { app }
    }
}

impl<R: Runtime> CallObserver for EventObserver<R> {
    fn on_update(&self, update: CallUpdate) {
        if let Err(e) = self.app.emit("call-update", update) {
            tracing::warn!("Failed to emit call update: {}", e);
        }
    }
}

/// Hands IVR prompts to the webview's speech synthesis as `ivr-prompt`
/// events. The page reports back through `call_prompt_finished`.
pub struct WebviewSpeech<R: Runtime> {
    app: AppHandle<R>,
}

impl<R: Runtime> WebviewSpeech<R> {
    pub fn new(app: AppHandle<R>) -> Self {
        Self { app }
    }
}

impl<R: Runtime> SpeechSink for WebviewSpeech<R> {
    fn speak(&self, request: SpeechRequest) -> Result<(), String> {
        self.app
            .emit("ivr-prompt", request)
            .map_err(|e| format!("Failed to emit prompt: {}", e))
    }
}

/// Webview speech player, absent when recorded prompt clips are used
pub struct PromptState {
    pub speech: Option<Arc<HostSpeechPlayer>>,
}

/// The webview finished speaking a prompt
#[tauri::command]
pub fn call_prompt_finished(state: State<'_, PromptState>, id: u64) -> bool {
    state
        .speech
        .as_ref()
        .map(|speech| speech.finished(id))
        .unwrap_or(false)
}

/// Place a simulated call to an agent
#[tauri::command]
pub fn call_start(
    state: State<'_, CallState>,
    agent: AgentDescriptor,
    source: Option<EntryPoint>,
) -> Result<(), String> {
    state
        .handle
        .start_call(agent, source.unwrap_or_default())
        .map_err(|e| e.to_string())
}

/// Hang up
#[tauri::command]
pub fn call_end(state: State<'_, CallState>) -> Result<(), String> {
    state.handle.end_call().map_err(|e| e.to_string())
}

/// Keypad press, one of 0-9 * # A-D
#[tauri::command]
pub fn call_press_key(state: State<'_, CallState>, key: String) -> Result<(), String> {
    let key = key
        .chars()
        .next()
        .ok_or_else(|| "No key given".to_string())?;
    state.handle.press_key(key).map_err(|e| e.to_string())
}

#[tauri::command]
pub fn call_toggle_mute(state: State<'_, CallState>) -> Result<(), String> {
    state.handle.toggle_mute().map_err(|e| e.to_string())
}

#[tauri::command]
pub fn call_toggle_hold(state: State<'_, CallState>) -> Result<(), String> {
    state.handle.toggle_hold().map_err(|e| e.to_string())
}

#[tauri::command]
pub fn call_toggle_ambience(state: State<'_, CallState>) -> Result<(), String> {
    state.handle.toggle_ambience().map_err(|e| e.to_string())
}

/// Set master volume (0.0 - 1.0)
#[tauri::command]
pub fn call_set_volume(state: State<'_, CallState>, volume: f32) -> Result<(), String> {
    state.handle.set_volume(volume).map_err(|e| e.to_string())
}

/// Current call state for a first render
#[tauri::command]
pub fn call_snapshot(state: State<'_, CallState>) -> CallSession {
    state.handle.snapshot()
}

/// Calls completed since the app started
#[tauri::command]
pub fn call_history(state: State<'_, CallState>) -> Vec<CallRecord> {
    state.handle.history()
}

#[tauri::command]
pub fn call_list_voices() -> Vec<VoiceOption> {
    VOICES.to_vec()
}

/// List microphones (empty without sound card support)
#[tauri::command]
pub fn call_list_input_devices() -> Result<Vec<String>, String> {
    #[cfg(feature = "devices")]
    {
        crate::audio::CpalBackend::list_input_devices().map_err(|e| e.to_string())
    }
    #[cfg(not(feature = "devices"))]
    {
        Ok(Vec::new())
    }
}

/// List speakers (empty without sound card support)
#[tauri::command]
pub fn call_list_output_devices() -> Result<Vec<String>, String> {
    #[cfg(feature = "devices")]
    {
        crate::audio::CpalBackend::list_output_devices().map_err(|e| e.to_string())
    }
    #[cfg(not(feature = "devices"))]
    {
        Ok(Vec::new())
    }
}
