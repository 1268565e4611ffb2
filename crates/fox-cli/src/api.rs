//! HTTP surface for the dashboard.
//!
//! Every endpoint answers 200 with a JSON body carrying `status`; failures
//! are reported in the body, never as HTTP errors.

use std::convert::Infallible;
use std::path::PathBuf;
use tracing::{debug, warn};
use warp::filters::BoxedFilter;
use warp::hyper::body::Bytes;
use warp::reply::Json;
use warp::{Filter, Rejection, Reply};

use fox_link::Intent;
use fox_proto::api::{
    CalibrateReply, CalibrateRequest, ConfigBody, ConfigReply, DetectStatus, MessageReply, Peak, Results,
    SettingsRequest, SpeedReply, Status,
};
use fox_scan::{ControlError, ControllerState, ScanController, StatusSnapshot};

const MAX_BODY_BYTES: u64 = 16 * 1024;

/// API routes under `/api`, then the dashboard's static files if configured.
pub fn routes(
    ctl: ScanController,
    web_dir: Option<PathBuf>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    api(ctl).or(static_files(web_dir))
}

fn static_files(web_dir: Option<PathBuf>) -> BoxedFilter<(warp::fs::File,)> {
    match web_dir {
        Some(dir) => warp::get().and(warp::fs::dir(dir)).boxed(),
        None => warp::any()
            .and_then(|| async { Err::<warp::fs::File, Rejection>(warp::reject::not_found()) })
            .boxed(),
    }
}

fn with_ctl(ctl: ScanController) -> impl Filter<Extract = (ScanController,), Error = Infallible> + Clone {
    warp::any().map(move || ctl.clone())
}

fn body() -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::bytes())
}

pub fn api(ctl: ScanController) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let init = warp::path!("init_drivers")
        .and(warp::post())
        .and(with_ctl(ctl.clone()))
        .and_then(init_drivers);
    let drive = warp::path!("move" / String)
        .and(warp::post())
        .and(with_ctl(ctl.clone()))
        .and_then(move_rover);
    let set_speed = warp::path!("speed" / String)
        .and(warp::post())
        .and(with_ctl(ctl.clone()))
        .and_then(set_speed);
    let get_speed = warp::path!("speed")
        .and(warp::get())
        .and(with_ctl(ctl.clone()))
        .and_then(get_speed);
    let start = warp::path!("detect" / "start")
        .and(warp::post())
        .and(with_ctl(ctl.clone()))
        .and_then(start_detection);
    let stop = warp::path!("detect" / "stop")
        .and(warp::post())
        .and(with_ctl(ctl.clone()))
        .and_then(stop_detection);
    let status = warp::path!("detect" / "status")
        .and(warp::get())
        .and(with_ctl(ctl.clone()))
        .and_then(detect_status);
    let calibrate = warp::path!("calibrate")
        .and(warp::post())
        .and(body())
        .and(with_ctl(ctl.clone()))
        .and_then(calibrate);
    let settings = warp::path!("settings")
        .and(warp::post())
        .and(body())
        .and(with_ctl(ctl.clone()))
        .and_then(settings);
    let config = warp::path!("config")
        .and(warp::get())
        .and(with_ctl(ctl))
        .and_then(config);

    warp::path("api").and(
        init.or(drive)
            .or(set_speed)
            .or(get_speed)
            .or(start)
            .or(stop)
            .or(status)
            .or(calibrate)
            .or(settings)
            .or(config),
    )
}

fn json<T: serde::Serialize>(body: &T) -> Result<Json, Infallible> {
    Ok(warp::reply::json(body))
}

fn failed(e: ControlError) -> Result<Json, Infallible> {
    warn!("api: {}", e);
    json(&MessageReply::error(e.to_string()))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn detect_status_body(snap: &StatusSnapshot) -> DetectStatus {
    DetectStatus {
        car_connected: snap.devices.car_connected,
        sdr_ready: snap.devices.sdr_ready,
        running: snap.running,
        current_db: snap.current_db.map(round2),
        results: Results(
            snap.session
                .readings()
                .iter()
                .map(|r| (r.angle_deg, round2(r.power_db)))
                .collect(),
        ),
        rotation_duration: snap.rotation_duration_s,
        peak: snap.session.peak().map(|r| Peak { angle: round2(r.angle_deg), power: round2(r.power_db) }),
    }
}

async fn init_drivers(ctl: ScanController) -> Result<Json, Infallible> {
    match ctl.init_drivers().await {
        Ok(()) => json(&MessageReply::success("Drivers initialized and car connected.")),
        Err(e) => failed(e),
    }
}

async fn move_rover(direction: String, ctl: ScanController) -> Result<Json, Infallible> {
    let Ok(intent) = direction.parse::<Intent>() else {
        return json(&MessageReply::error("Invalid direction."));
    };
    match ctl.drive(intent).await {
        Ok(()) => json(&MessageReply::success(format!("Car moved {}.", intent))),
        Err(e) => failed(e),
    }
}

async fn set_speed(value: String, ctl: ScanController) -> Result<Json, Infallible> {
    let Ok(value) = value.parse::<i64>() else {
        return json(&MessageReply::error(format!("Invalid speed: {}", value)));
    };
    match ctl.set_speed(value).await {
        Ok(speed) => json(&SpeedReply { status: Status::Success, speed }),
        Err(e) => failed(e),
    }
}

async fn get_speed(ctl: ScanController) -> Result<Json, Infallible> {
    let status = match ctl.state() {
        ControllerState::Uninitialized => Status::Error,
        _ => Status::Success,
    };
    json(&SpeedReply { status, speed: ctl.profile().speed_pct })
}

async fn start_detection(ctl: ScanController) -> Result<Json, Infallible> {
    match ctl.start_detection() {
        Ok(id) => {
            debug!("api: scan session {} started", id);
            json(&MessageReply::running("Detection cycle started in background."))
        }
        Err(e) => failed(e),
    }
}

async fn stop_detection(ctl: ScanController) -> Result<Json, Infallible> {
    match ctl.stop_detection().await {
        Ok(true) => json(&MessageReply::success("Detection stopped.")),
        Ok(false) => json(&MessageReply::success("Detection was not running.")),
        Err(e) => failed(e),
    }
}

async fn detect_status(ctl: ScanController) -> Result<Json, Infallible> {
    json(&detect_status_body(&ctl.snapshot()))
}

async fn calibrate(body: Bytes, ctl: ScanController) -> Result<Json, Infallible> {
    let req: CalibrateRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json(&MessageReply::error(format!("Invalid calibration request: {}", e))),
    };
    match ctl.calibrate(req.duration, req.save).await {
        Ok(out) => json(&CalibrateReply {
            status: Status::Success,
            message: if out.saved {
                format!("Calibrated: {:.2}s per full turn.", out.duration_s)
            } else {
                format!("Test rotation of {:.2}s done; not saved.", out.duration_s)
            },
            saved: Some(out.saved),
            speed: Some(out.speed_pct),
        }),
        Err(e) => failed(e),
    }
}

async fn settings(body: Bytes, ctl: ScanController) -> Result<Json, Infallible> {
    let req: SettingsRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json(&MessageReply::error(format!("Invalid settings: {}", e))),
    };
    match ctl.update_settings(req.rotation_duration, req.measurement_time) {
        Ok(_) => json(&MessageReply::success("Settings saved.")),
        Err(e) => failed(e),
    }
}

async fn config(ctl: ScanController) -> Result<Json, Infallible> {
    let p = ctl.profile();
    json(&ConfigReply {
        status: Status::Success,
        config: ConfigBody {
            speed: p.speed_pct,
            rotation_duration: p.rotation_duration_s,
            measurement_time: p.measurement_time_s,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fox_link::mock::{MockFault, MockRover};
    use fox_link::Frame;
    use fox_radio::sim::ScriptedSampler;
    use fox_scan::ScanConfig;
    use fox_store::{CalibrationProfile, MemoryStore};
    use serde::de::DeserializeOwned;
    use std::sync::Arc;
    use std::time::Duration;

    fn controller(readings: &[f64]) -> (ScanController, MockRover) {
        let rover = MockRover::new(4.0);
        let ctl = ScanController::new(
            Box::new(rover.clone()),
            Box::new(ScriptedSampler::new(readings.iter().copied())),
            Arc::new(MemoryStore::with_profile(CalibrationProfile {
                rotation_duration_s: 4.0,
                measurement_time_s: 1.0,
                speed_pct: 15,
            })),
            ScanConfig { readings_per_tick: 1, ..ScanConfig::default() },
        );
        (ctl, rover)
    }

    async fn call<T: DeserializeOwned>(ctl: &ScanController, method: &str, path: &str, body: &str) -> T {
        let res = warp::test::request()
            .method(method)
            .path(path)
            .body(body.to_string())
            .reply(&api(ctl.clone()))
            .await;
        assert_eq!(res.status(), 200, "{} {}", method, path);
        serde_json::from_slice(res.body()).unwrap()
    }

    #[tokio::test]
    async fn commands_before_init_report_errors() {
        let (ctl, _) = controller(&[]);
        let r: MessageReply = call(&ctl, "POST", "/api/move/left", "").await;
        assert_eq!(r.status, Status::Error);
        let r: MessageReply = call(&ctl, "POST", "/api/detect/start", "").await;
        assert_eq!(r.status, Status::Error);
        let r: SpeedReply = call(&ctl, "GET", "/api/speed", "").await;
        assert_eq!((r.status, r.speed), (Status::Error, 15));
        let s: DetectStatus = call(&ctl, "GET", "/api/detect/status", "").await;
        assert!(!s.car_connected && !s.sdr_ready && !s.running);
        assert!(s.results.is_empty());
        assert_eq!(s.current_db, None);
    }

    #[tokio::test(start_paused = true)]
    async fn init_move_and_speed() {
        let (ctl, rover) = controller(&[]);
        let r: MessageReply = call(&ctl, "POST", "/api/init_drivers", "").await;
        assert_eq!(r.status, Status::Success);

        let r: MessageReply = call(&ctl, "POST", "/api/move/front", "").await;
        assert_eq!(r.status, Status::Success);
        assert!(rover.frames().contains(&Frame::motion(Intent::Forward, 15)));
        assert_eq!(rover.moving(), None);
        let r: MessageReply = call(&ctl, "POST", "/api/move/stop", "").await;
        assert_eq!(r.status, Status::Success);
        let r: MessageReply = call(&ctl, "POST", "/api/move/sideways", "").await;
        assert_eq!(r.message, "Invalid direction.");

        let r: SpeedReply = call(&ctl, "POST", "/api/speed/250", "").await;
        assert_eq!(r.speed, 100);
        let r: MessageReply = call(&ctl, "POST", "/api/speed/fast", "").await;
        assert_eq!(r.status, Status::Error);
        let r: SpeedReply = call(&ctl, "GET", "/api/speed", "").await;
        assert_eq!((r.status, r.speed), (Status::Success, 100));
    }

    #[tokio::test]
    async fn malformed_reply_shows_up_in_status() {
        let (ctl, rover) = controller(&[]);
        let _: MessageReply = call(&ctl, "POST", "/api/init_drivers", "").await;
        rover.inject(MockFault::Garbled);
        let r: MessageReply = call(&ctl, "POST", "/api/move/left", "").await;
        assert_eq!(r.status, Status::Error);
        let s: DetectStatus = call(&ctl, "GET", "/api/detect/status", "").await;
        assert!(!s.car_connected);
        assert!(s.sdr_ready);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_results_keep_sample_order() {
        let (ctl, _) = controller(&[-80.004, -55.0, -55.0, -100.0]);
        let _: MessageReply = call(&ctl, "POST", "/api/init_drivers", "").await;
        let r: MessageReply = call(&ctl, "POST", "/api/detect/start", "").await;
        assert_eq!(r.status, Status::Running);
        let r: MessageReply = call(&ctl, "POST", "/api/detect/start", "").await;
        assert_eq!(r.status, Status::Error);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let res = warp::test::request().method("GET").path("/api/detect/status").reply(&api(ctl.clone())).await;
        let text = std::str::from_utf8(res.body()).unwrap();
        assert!(text.contains(r#""results":{"0.00":-80.0,"90.00":-55.0,"180.00":-55.0,"270.00":-100.0}"#), "{text}");

        let s: DetectStatus = serde_json::from_str(text).unwrap();
        assert!(!s.running);
        assert_eq!(s.peak, Some(Peak { angle: 90.0, power: -55.0 }));
        assert_eq!(s.rotation_duration, 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_harmless_and_keeps_results() {
        let (ctl, rover) = controller(&[-60.0]);
        let r: MessageReply = call(&ctl, "POST", "/api/detect/stop", "").await;
        assert_eq!(r.status, Status::Success);

        let _: MessageReply = call(&ctl, "POST", "/api/init_drivers", "").await;
        let _: MessageReply = call(&ctl, "POST", "/api/detect/start", "").await;
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let r: MessageReply = call(&ctl, "POST", "/api/detect/stop", "").await;
        assert_eq!(r.message, "Detection stopped.");
        assert_eq!(rover.moving(), None);
        let s: DetectStatus = call(&ctl, "GET", "/api/detect/status", "").await;
        assert!(!s.running);
        assert_eq!(s.results.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn calibrate_and_settings() {
        let (ctl, _) = controller(&[]);
        let _: MessageReply = call(&ctl, "POST", "/api/init_drivers", "").await;

        let r: MessageReply = call(&ctl, "POST", "/api/calibrate", "{not json").await;
        assert_eq!(r.status, Status::Error);
        let r: MessageReply = call(&ctl, "POST", "/api/calibrate", r#"{"duration": -2}"#).await;
        assert_eq!(r.status, Status::Error);

        let r: CalibrateReply = call(&ctl, "POST", "/api/calibrate", r#"{"duration": 3.25}"#).await;
        assert_eq!((r.status, r.saved, r.speed), (Status::Success, Some(true), Some(15)));
        let c: ConfigReply = call(&ctl, "GET", "/api/config", "").await;
        assert_eq!(c.config.rotation_duration, 3.25);

        let r: CalibrateReply = call(&ctl, "POST", "/api/calibrate", r#"{"duration": 1.0, "save": false}"#).await;
        assert_eq!(r.saved, Some(false));

        let r: MessageReply =
            call(&ctl, "POST", "/api/settings", r#"{"rotation_duration": 5.0, "measurement_time": 0.2}"#).await;
        assert_eq!(r.status, Status::Success);
        let c: ConfigReply = call(&ctl, "GET", "/api/config", "").await;
        assert_eq!(c.config, ConfigBody { speed: 15, rotation_duration: 5.0, measurement_time: 0.2 });

        let r: MessageReply =
            call(&ctl, "POST", "/api/settings", r#"{"rotation_duration": 0, "measurement_time": 0.2}"#).await;
        assert_eq!(r.status, Status::Error);
    }

    #[tokio::test]
    async fn static_files_are_optional() {
        let (ctl, _) = controller(&[]);
        let res = warp::test::request().path("/index.html").reply(&routes(ctl.clone(), None)).await;
        assert_eq!(res.status(), 404);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>foxhunt</h1>").unwrap();
        let res = warp::test::request().path("/").reply(&routes(ctl, Some(dir.path().to_path_buf()))).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.body().as_ref(), b"<h1>foxhunt</h1>");
    }
}
