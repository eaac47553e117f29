//! The blindscan operation endpoint
//!
//! One route keyed by operation name. Every response is a JSON map; every
//! input problem is a synchronous `{"error": ...}` map with no session
//! state change. Operations that borrow the frontend can block for seconds,
//! so the dispatch runs on the blocking pool.

use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{json, Value};

use satscan_core::dvb::{Band, Polarisation};
use satscan_core::scan::mux::SelectedPeak;
use satscan_core::scan::session::{PeakDetectMode, PolSelect, ScanOptions, ScanRequest};
use satscan_core::scan::ScanError;
use satscan_core::ScanManager;

use crate::AppState;

/// POST /api/blindscan/{op} with a JSON argument map
pub async fn dispatch(
    State(state): State<AppState>,
    Path(op): Path<String>,
    Json(args): Json<Value>,
) -> Json<Value> {
    run(state, op, args).await
}

/// GET variant for the read-only operations, mirroring the POST dispatch
/// with an empty argument map
pub async fn dispatch_get(State(state): State<AppState>, Path(op): Path<String>) -> Json<Value> {
    run(state, op, json!({})).await
}

async fn run(state: AppState, op: String, args: Value) -> Json<Value> {
    let manager = state.manager.clone();

    // session operations block on the device mutex; keep the runtime free
    let result = tokio::task::spawn_blocking(move || handle_op(&manager, &op, &args)).await;
    Json(result.unwrap_or_else(|_| error("internal error")))
}

fn error(message: &str) -> Value {
    json!({ "error": message })
}

fn get_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn get_u32(args: &Value, key: &str) -> Option<u32> {
    args.get(key).and_then(Value::as_u64).map(|v| v as u32)
}

fn get_i64(args: &Value, key: &str) -> Option<i64> {
    args.get(key).and_then(Value::as_i64)
}

fn get_pol(args: &Value) -> Option<Polarisation> {
    get_str(args, "polarisation")
        .and_then(|s| s.chars().next())
        .and_then(Polarisation::from_char)
}

fn handle_op(manager: &ScanManager, op: &str, args: &Value) -> Value {
    match op {
        "list_satconfs" => op_list_satconfs(manager, args),
        "start" => op_start(manager, args),
        "status" => op_status(manager, args),
        "spectrum" => op_spectrum(manager, args),
        "peaks" => op_peaks(manager, args),
        "prescan" => op_prescan(manager, args),
        "create_muxes" => op_create_muxes(manager, args),
        "cancel" => op_cancel(manager, args),
        "release" => op_release(manager, args),
        _ => error("Unknown operation"),
    }
}

fn op_list_satconfs(manager: &ScanManager, args: &Value) -> Value {
    let Some(network) = get_str(args, "network_uuid") else {
        return error("Missing network_uuid");
    };
    let entries = manager.devices().list_satconfs(network);
    json!({ "entries": entries })
}

fn op_start(manager: &ScanManager, args: &Value) -> Value {
    let Some(frontend) = get_str(args, "frontend_uuid") else {
        return error("Missing frontend_uuid or network_uuid");
    };
    let Some(network) = get_str(args, "network_uuid") else {
        return error("Missing frontend_uuid or network_uuid");
    };
    let (Some(start_freq), Some(end_freq)) =
        (get_u32(args, "start_freq"), get_u32(args, "end_freq"))
    else {
        return error("Missing start_freq or end_freq");
    };

    let polarisation = get_str(args, "polarisation")
        .and_then(|s| s.chars().next())
        .map(PolSelect::from_char)
        .unwrap_or(PolSelect::Both);

    let options = ScanOptions {
        fft_size: get_u32(args, "fft_size").unwrap_or(512),
        resolution_khz: get_u32(args, "resolution").unwrap_or(0),
        peak_detect: PeakDetectMode::from_code(get_i64(args, "peak_detect").unwrap_or(0)),
    };

    let request = ScanRequest {
        frontend: frontend.to_string(),
        satconf: get_str(args, "satconf_uuid").map(str::to_string),
        network: network.to_string(),
        start_freq,
        end_freq,
        polarisation,
        options,
    };

    match manager.start(request) {
        Ok(uuid) => json!({ "uuid": uuid, "status": "started" }),
        Err(e) => {
            tracing::warn!("blindscan start refused: {e}");
            error(&e.to_string())
        }
    }
}

fn op_status(manager: &ScanManager, args: &Value) -> Value {
    let Some(uuid) = get_str(args, "uuid") else {
        return error("Missing uuid");
    };
    match manager.status(uuid) {
        Some(snapshot) => {
            let mut v = serde_json::to_value(snapshot).unwrap_or_else(|_| json!({}));
            v["uuid"] = json!(uuid);
            v
        }
        None => error("Session not found"),
    }
}

fn op_spectrum(manager: &ScanManager, args: &Value) -> Value {
    let Some(uuid) = get_str(args, "uuid") else {
        return error("Missing uuid or polarisation");
    };
    let Some(pol) = get_pol(args) else {
        return error("Missing uuid or polarisation");
    };
    let band = get_u32(args, "band")
        .and_then(Band::from_index)
        .unwrap_or(Band::Low);

    match manager.spectrum(uuid, pol, band) {
        Some(buffer) => json!({
            "points": buffer.points,
            "count": buffer.points.len(),
            "pol": pol,
            "band": band.index(),
        }),
        None => error("No spectrum data available"),
    }
}

fn op_peaks(manager: &ScanManager, args: &Value) -> Value {
    let Some(uuid) = get_str(args, "uuid") else {
        return error("Missing uuid");
    };
    match manager.peaks(uuid) {
        Some(peaks) => json!({ "count": peaks.len(), "peaks": peaks }),
        None => error("Session not found"),
    }
}

fn op_prescan(manager: &ScanManager, args: &Value) -> Value {
    let Some(uuid) = get_str(args, "uuid") else {
        return error("Missing uuid or polarisation");
    };
    let Some(pol) = get_pol(args) else {
        return error("Missing uuid or polarisation");
    };
    let Some(frequency) = get_u32(args, "frequency") else {
        return error("Missing frequency");
    };

    match manager.prescan(uuid, frequency, pol) {
        Ok(outcome) => serde_json::to_value(&outcome).unwrap_or_else(|_| json!({})),
        Err(ScanError::SessionNotFound) => error("Session not found"),
        Err(e) => {
            tracing::warn!(uuid, frequency, "prescan failed: {e}");
            json!({ "locked": false, "error": e.to_string() })
        }
    }
}

fn op_create_muxes(manager: &ScanManager, args: &Value) -> Value {
    let Some(uuid) = get_str(args, "uuid") else {
        return error("Missing uuid");
    };

    // the peak list arrives either as a JSON array or as an encoded string
    let selected: Vec<SelectedPeak> = match args.get("peaks") {
        Some(Value::String(s)) if !s.is_empty() => match serde_json::from_str(s) {
            Ok(list) => list,
            Err(e) => return error(&format!("Bad peaks list: {e}")),
        },
        Some(v @ Value::Array(_)) => match serde_json::from_value(v.clone()) {
            Ok(list) => list,
            Err(e) => return error(&format!("Bad peaks list: {e}")),
        },
        _ => Vec::new(),
    };

    match manager.create_muxes(uuid, &selected) {
        Ok(created) => json!({ "created": created }),
        Err(ScanError::SessionNotFound) => error("Session not found"),
        Err(e) => error(&e.to_string()),
    }
}

fn op_cancel(manager: &ScanManager, args: &Value) -> Value {
    let Some(uuid) = get_str(args, "uuid") else {
        return error("Missing uuid");
    };
    manager.cancel(uuid);
    json!({ "status": "cancelled" })
}

fn op_release(manager: &ScanManager, args: &Value) -> Value {
    let Some(uuid) = get_str(args, "uuid") else {
        return error("Missing uuid");
    };
    manager.release(uuid);
    json!({ "status": "released" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use satscan_core::dvb::frontend::FrontendAdapter;
    use satscan_core::dvb::satconf::SatConf;
    use satscan_core::dvb::sim::{SimCarrier, SimFrontend};
    use satscan_core::registry::{DeviceRegistry, FrontendEntry, SatconfEntry};
    use satscan_core::scan::mux::MuxStore;
    use satscan_core::MemoryMuxStore;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn manager() -> ScanManager {
        let devices = Arc::new(DeviceRegistry::new());
        let carriers = vec![SimCarrier::new(
            11_012_000,
            22_000_000,
            Polarisation::Horizontal,
        )];
        devices.register_frontend(FrontendEntry {
            uuid: "fe-1".into(),
            name: "sim".into(),
            enabled: true,
            adapter: Arc::new(Mutex::new(FrontendAdapter::new(Box::new(SimFrontend::new(
                carriers,
            ))))),
            satconfs: vec![Arc::new(SatconfEntry {
                uuid: "sc-1".into(),
                enabled: true,
                satconf: SatConf::universal("dish"),
                networks: vec!["net-1".into()],
            })],
        });
        let muxes: Arc<dyn MuxStore> = Arc::new(MemoryMuxStore::new(vec!["net-1".into()]));
        ScanManager::new(devices, muxes)
    }

    fn wait_complete(manager: &ScanManager, uuid: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !manager.status(uuid).map(|s| s.state.is_terminal()).unwrap_or(true) {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_unknown_op() {
        let m = manager();
        let resp = handle_op(&m, "reticulate", &json!({}));
        assert_eq!(resp["error"], "Unknown operation");
    }

    #[test]
    fn test_start_requires_uuids() {
        let m = manager();
        let resp = handle_op(&m, "start", &json!({ "start_freq": 1, "end_freq": 2 }));
        assert_eq!(resp["error"], "Missing frontend_uuid or network_uuid");
    }

    #[test]
    fn test_start_requires_freqs() {
        let m = manager();
        let resp = handle_op(
            &m,
            "start",
            &json!({ "frontend_uuid": "fe-1", "network_uuid": "net-1" }),
        );
        assert_eq!(resp["error"], "Missing start_freq or end_freq");
    }

    #[test]
    fn test_full_operation_round_trip() {
        let m = manager();
        let resp = handle_op(
            &m,
            "start",
            &json!({
                "frontend_uuid": "fe-1",
                "network_uuid": "net-1",
                "satconf_uuid": "sc-1",
                "start_freq": 10_700_000,
                "end_freq": 11_700_000,
                "polarisation": "H",
            }),
        );
        assert_eq!(resp["status"], "started");
        let uuid = resp["uuid"].as_str().unwrap().to_string();
        wait_complete(&m, &uuid);

        let status = handle_op(&m, "status", &json!({ "uuid": uuid }));
        assert_eq!(status["state"], "complete");
        assert_eq!(status["progress"], 100);

        let spectrum = handle_op(
            &m,
            "spectrum",
            &json!({ "uuid": uuid, "polarisation": "H", "band": 0 }),
        );
        assert!(spectrum["count"].as_u64().unwrap() > 100);
        assert_eq!(spectrum["pol"], "H");

        let peaks = handle_op(&m, "peaks", &json!({ "uuid": uuid }));
        assert!(peaks["count"].as_u64().unwrap() >= 1);

        let prescan = handle_op(
            &m,
            "prescan",
            &json!({ "uuid": uuid, "frequency": 11_012_000, "polarisation": "H" }),
        );
        assert_eq!(prescan["locked"], true);
        assert_eq!(prescan["symbol_rate"], 22_000_000);

        let created = handle_op(
            &m,
            "create_muxes",
            &json!({
                "uuid": uuid,
                "peaks": [{
                    "frequency": 11_012_000,
                    "polarisation": "H",
                    "symbol_rate": 22_000_000,
                }],
            }),
        );
        assert_eq!(created["created"], 1);

        let released = handle_op(&m, "release", &json!({ "uuid": uuid }));
        assert_eq!(released["status"], "released");
        let gone = handle_op(&m, "status", &json!({ "uuid": uuid }));
        assert_eq!(gone["error"], "Session not found");
    }

    #[test]
    fn test_create_muxes_accepts_json_string() {
        let m = manager();
        let resp = handle_op(
            &m,
            "start",
            &json!({
                "frontend_uuid": "fe-1",
                "network_uuid": "net-1",
                "start_freq": 10_700_000,
                "end_freq": 11_700_000,
                "polarisation": "H",
            }),
        );
        let uuid = resp["uuid"].as_str().unwrap().to_string();
        wait_complete(&m, &uuid);

        let created = handle_op(
            &m,
            "create_muxes",
            &json!({
                "uuid": uuid,
                "peaks": "[{\"frequency\": 11500000, \"polarisation\": \"V\"}]",
            }),
        );
        assert_eq!(created["created"], 1);
    }

    #[test]
    fn test_spectrum_absent_band() {
        let m = manager();
        let resp = handle_op(
            &m,
            "start",
            &json!({
                "frontend_uuid": "fe-1",
                "network_uuid": "net-1",
                "start_freq": 10_700_000,
                "end_freq": 11_700_000,
                "polarisation": "H",
            }),
        );
        let uuid = resp["uuid"].as_str().unwrap().to_string();
        wait_complete(&m, &uuid);

        // high band was never scanned
        let spectrum = handle_op(
            &m,
            "spectrum",
            &json!({ "uuid": uuid, "polarisation": "H", "band": 1 }),
        );
        assert_eq!(spectrum["error"], "No spectrum data available");
    }

    #[test]
    fn test_list_satconfs() {
        let m = manager();
        let resp = handle_op(&m, "list_satconfs", &json!({ "network_uuid": "net-1" }));
        let entries = resp["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["frontend_uuid"], "fe-1");
        assert_eq!(entries[0]["unicable"], false);
    }
}
