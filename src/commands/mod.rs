//! Tauri plugin exposing the call engine to the web UI

pub mod call;

use std::sync::Arc;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{Manager, Runtime};

use crate::call::{CallController, CallDeps, JsonFileHistory};
use crate::config::CallConfig;
use crate::ivr::HostSpeechPlayer;
use crate::session::WebSocketConnector;
use call::{CallState, EventObserver, PromptState, WebviewSpeech};

/// Register with `tauri::Builder::default().plugin(voicedesk_lib::init())`
pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new("voicedesk")
        .invoke_handler(tauri::generate_handler![
            call::call_start,
            call::call_end,
            call::call_press_key,
            call::call_toggle_mute,
            call::call_toggle_hold,
            call::call_toggle_ambience,
            call::call_set_volume,
            call::call_snapshot,
            call::call_history,
            call::call_list_voices,
            call::call_list_input_devices,
            call::call_list_output_devices,
            call::call_prompt_finished,
        ])
        .setup(|app, _api| {
            crate::init_tracing();
            let config = CallConfig::load();
            let connector = Arc::new(WebSocketConnector::new(config.voice.clone()));
            let speech = match config.audio.prompt_clip_dir {
                Some(_) => None,
                None => Some(Arc::new(HostSpeechPlayer::new(
                    Arc::new(WebviewSpeech::new(app.clone())),
                    160,
                    config.audio.tone_volume,
                ))),
            };
            let mut deps = CallDeps::new(config, connector)
                .with_persistence(Arc::new(JsonFileHistory::new(JsonFileHistory::default_path())))
                .with_observer(Arc::new(EventObserver::new(app.clone())));
            if let Some(speech) = &speech {
                deps = deps.with_prompt_player(speech.clone());
            }
            #[cfg(feature = "devices")]
            let deps = {
                let audio = &deps.config.audio;
                let backend = crate::audio::CpalBackend::with_devices(
                    audio.input_device.clone(),
                    audio.output_device.clone(),
                );
                deps.with_backend(Arc::new(backend))
            };

            let handle = tauri::async_runtime::block_on(async move { CallController::spawn(deps) });
            app.manage(CallState { handle });
            app.manage(PromptState { speech });
            tracing::info!("Call engine ready");
            Ok(())
        })
        .build()
}
