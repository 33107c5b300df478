//! HTTP surface: paths, actions, status codes, response shapes.

mod common;

use axum::http::StatusCode;
use common::{post, request, Fixture};
use power_common::{CommandOutput, Marker};
use powerd::power::GATEWAY_SERVICE;
use serde_json::json;
use std::fs;

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_unknown_path_is_404() {
    let fx = Fixture::new();
    let (status, _) = post(&fx.state, "/does-not-exist", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_on_known_path_is_404() {
    let fx = Fixture::new();
    let (status, _) = request(&fx.state, "GET", "/init", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_action_is_404() {
    let fx = Fixture::new();
    let (status, _) = post(&fx.state, "/ajax", json!({ "action": "self_destruct" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_missing_action_is_400() {
    let fx = Fixture::new();
    let (status, body) = post(&fx.state, "/ajax", json!({ "keep_z2m": true })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.as_str().unwrap().contains("action"));
}

#[tokio::test]
async fn test_malformed_json_is_400() {
    let fx = Fixture::new();
    let (status, _) = request(&fx.state, "POST", "/ajax", "{\"action\": ").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(&fx.state, "POST", "/save", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Status
// ============================================================================

#[tokio::test]
async fn test_init_reports_snapshot() {
    let fx = Fixture::new();
    fs::write(fx.layout.version_file(), "2.0.2\n").unwrap();
    fs::write(fx.layout.cmdline_file(), "console=tty1 boot=overlay\n").unwrap();
    fs::create_dir_all(&fx.layout.overlay_lower_dir).unwrap();
    fx.runner
        .respond("timedatectl", CommandOutput::ok("NTP=no\nNTPSynchronized=no\n"));

    let (status, body) = post(&fx.state, "/init", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["candle_version"], "2.0.2");
    assert_eq!(body["candle_original_version"], "unknown");
    assert_eq!(body["ntp"], false);
    assert_eq!(body["old_overlay_active"], true);
    assert_eq!(body["ro_exists"], true);
    assert_eq!(body["system_update_in_progress"], false);
    assert_eq!(body["bootup_actions_failed"], false);
    assert!(body["hours"].as_u64().unwrap() < 24);
    assert!(body["minutes"].as_u64().unwrap() < 60);
    assert_eq!(body["disk_usage"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_init_sees_running_update() {
    let fx = Fixture::new();
    fx.table.set(&["sudo bash /home/pi/.webthings/data/live_system_update.sh"]);

    let (_, body) = post(&fx.state, "/init", json!({})).await;
    assert_eq!(body["system_update_in_progress"], true);

    fx.table.clear();
    let (_, body) = post(&fx.state, "/init", json!({})).await;
    assert_eq!(body["system_update_in_progress"], false);
}

// ============================================================================
// Clock
// ============================================================================

#[tokio::test]
async fn test_set_time() {
    let fx = Fixture::new();
    let (status, body) = post(&fx.state, "/set-time", json!({ "hours": "8", "minutes": 15 })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "state": true, "hours": 8, "minutes": 15 }));

    let date = fx
        .runner
        .calls()
        .into_iter()
        .find(|c| c.program == "date")
        .unwrap();
    assert!(date.privileged);
    assert!(date.args[1].ends_with(" 08:15:00"));
}

#[tokio::test]
async fn test_set_time_rejects_injection() {
    let fx = Fixture::new();
    for body in [
        json!({ "hours": "12; reboot", "minutes": "00" }),
        json!({ "hours": "25", "minutes": "00" }),
        json!({ "hours": "12" }),
        json!({ "hours": true, "minutes": "00" }),
    ] {
        let (status, _) = post(&fx.state, "/set-time", body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
    }
    assert!(fx.runner.calls().is_empty());
}

#[tokio::test]
async fn test_set_time_command_failure_is_500() {
    let fx = Fixture::new();
    fx.runner.respond("date", CommandOutput::failed(1, "permission denied"));
    let (status, body) = post(&fx.state, "/set-time", json!({ "hours": "8", "minutes": "0" })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "state": false }));
}

#[tokio::test]
async fn test_set_ntp() {
    let fx = Fixture::new();
    let (status, body) = post(&fx.state, "/set-ntp", json!({ "ntp": false })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Changed Network Time state to false");
    assert!(fx.runner.ran("timedatectl", &["set-ntp", "off"]));
}

// ============================================================================
// Power
// ============================================================================

#[tokio::test]
async fn test_power_routes_do_not_wait() {
    let fx = Fixture::new();

    let (status, body) = post(&fx.state, "/shutdown", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Shutting down");

    let (_, body) = post(&fx.state, "/reboot", json!({})).await;
    assert_eq!(body, "Rebooting");

    let (_, body) = post(&fx.state, "/restart", json!({})).await;
    assert_eq!(body, "Restarting");

    assert!(fx.runner.calls().is_empty());
    let detached = fx.runner.detached();
    assert_eq!(detached.len(), 3);
    assert!(fx.runner.ran("systemctl", &["restart", GATEWAY_SERVICE]));
}

// ============================================================================
// Ajax actions
// ============================================================================

#[tokio::test]
async fn test_reset_stages_factory_reset() {
    let fx = Fixture::new();
    let (status, body) = post(
        &fx.state,
        "/ajax",
        json!({ "action": "reset", "keep_z2m": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "state": "ok" }));

    let markers = fx.state.registry.markers();
    assert!(markers.exists(Marker::KeepZ2m));
    assert!(!markers.exists(Marker::KeepBluetooth));
    assert_eq!(
        fs::read_to_string(markers.boot_action_path()).unwrap(),
        "#!/bin/bash\n# factory reset\n"
    );
}

#[tokio::test]
async fn test_manual_update_stages_script() {
    let fx = Fixture::new();
    let (_, body) = post(&fx.state, "/ajax", json!({ "action": "manual_update" })).await;
    assert_eq!(body, json!({ "state": "ok" }));
    assert!(fx.state.registry.markers().exists(Marker::ReadWriteOnce));
}

#[tokio::test]
async fn test_reboot_update_through_api() {
    let fx = Fixture::new();
    let (_, body) = post(
        &fx.state,
        "/ajax",
        json!({ "action": "start_system_update", "cutting_edge": true }),
    )
    .await;
    assert_eq!(body["state"], true);
    assert_eq!(body["live_update"], false);

    let markers = fx.state.registry.markers();
    assert!(markers.exists(Marker::CuttingEdge));
    assert!(markers.exists(Marker::ReadWriteOnce));
    assert_eq!(
        fs::read(markers.boot_action_path()).unwrap(),
        common::UPDATE_SCRIPT
    );

    // Anything else in the update group is now refused
    let (_, body) = post(&fx.state, "/ajax", json!({ "action": "manual_update" })).await;
    assert_eq!(body["state"], "busy");
}

#[tokio::test]
async fn test_failed_fetch_reports_false() {
    let fx = Fixture::new();
    fx.fetcher.serve(None);
    let (status, body) = post(
        &fx.state,
        "/ajax",
        json!({ "action": "start_system_update", "cutting_edge": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], false);
    assert!(body["reason"].is_string());
    assert!(!fx.state.registry.markers().exists(Marker::CuttingEdge));
    assert!(!fx.state.registry.markers().boot_action_staged());
}

#[tokio::test]
async fn test_poll_filters_dmesg() {
    let fx = Fixture::new();
    fx.runner.respond(
        "dmesg",
        CommandOutput::ok("[ 1.0] eth0: link up\n[ 2.0] Candle: files check failed\n"),
    );
    let (_, body) = post(&fx.state, "/ajax", json!({ "action": "poll" })).await;
    assert_eq!(body["state"], "ok");
    assert_eq!(body["dmesg"], "]  files check failed\n");
}

#[tokio::test]
async fn test_files_check_on_old_version() {
    let fx = Fixture::new();
    let (_, body) = post(&fx.state, "/ajax", json!({ "action": "files_check" })).await;
    assert_eq!(body["state"], "ok");
    assert_eq!(
        body["files_check_output"],
        "Not supported by this older Candle version."
    );
}

#[tokio::test]
async fn test_anonymous_mqtt() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.layout.mosquitto_conf.parent().unwrap()).unwrap();
    fs::write(&fx.layout.mosquitto_conf, "listener 1883\nallow_anonymous false\n").unwrap();

    let (_, body) = post(
        &fx.state,
        "/ajax",
        json!({ "action": "anonymous_mqtt", "allow_anonymous_mqtt": true }),
    )
    .await;
    assert_eq!(body, json!({ "state": true }));

    let (_, status) = post(&fx.state, "/init", json!({})).await;
    assert_eq!(status["allow_anonymous_mqtt"], true);
    assert!(fx.runner.ran("systemctl", &["restart", "mosquitto.service"]));
}

#[tokio::test]
async fn test_get_stats() {
    let fx = Fixture::new();
    let vcgencmd = ["/usr/bin/vcgencmd", "/opt/vc/bin/vcgencmd"];
    for program in vcgencmd {
        fx.runner.respond(program, CommandOutput::ok("throttled=0x50000\n"));
    }

    let (status, body) = post(&fx.state, "/ajax", json!({ "action": "get_stats" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], true);
    assert!(body["total_memory"].as_u64().unwrap() > 0);
    assert_eq!(body["low_voltage"], true);
    assert_eq!(body["low_voltage_now"], false);
    assert_eq!(body["low_voltage_ever_observed"], true);
}

#[tokio::test]
async fn test_acknowledge_bootup_failure() {
    let fx = Fixture::new();
    fx.state
        .registry
        .markers()
        .set(Marker::BootupActionsFailed)
        .unwrap();

    let (_, status) = post(&fx.state, "/init", json!({})).await;
    assert_eq!(status["bootup_actions_failed"], true);

    let (_, body) = post(
        &fx.state,
        "/ajax",
        json!({ "action": "acknowledge_bootup_failure" }),
    )
    .await;
    assert_eq!(body["state"], "ok");

    let (_, status) = post(&fx.state, "/init", json!({})).await;
    assert_eq!(status["bootup_actions_failed"], false);
}
