//! Attachment handshake over plain HTTP

use std::time::Duration;

use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use wgmesh_attach::{DeviceReport, Handshake, Mode, Target, Timeouts, COMPLETION_MARKER};
use wgmesh_common::Error;

const SCRIPT: &str = "#!/bin/bash\necho bootstrap\n";

fn timeouts() -> Timeouts {
    Timeouts {
        gathering: Duration::from_millis(500),
        offering: Duration::from_secs(2),
        observing: Duration::from_secs(2),
        tick: Duration::from_millis(100),
    }
}

async fn start(mode: Mode, timeouts: Timeouts) -> (String, JoinHandle<wgmesh_common::Result<DeviceReport>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(
        Handshake::new(listener, None, timeouts).run(SCRIPT.to_string(), mode),
    );
    (base, handle)
}

fn local_target() -> Mode {
    Mode::Preselected(Target {
        address: "127.0.0.1".parse().unwrap(),
        mac: Some("02:00:00:00:00:05".to_string()),
    })
}

async fn discover(client: &reqwest::Client, base: &str) -> reqwest::Response {
    client
        .post(format!("{base}/bootstrap/"))
        .form(&[
            ("hostname", "node-a"),
            ("mac", "02:00:00:00:00:05"),
            ("scriptversion", "1"),
            ("wg_public", "NODEPUB="),
        ])
        .send()
        .await
        .unwrap()
}

async fn respond(client: &reqwest::Client, base: &str, text: &str) -> StatusCode {
    client
        .post(format!("{base}/bootstrap/response/"))
        .form(&[("text", text)])
        .send()
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn preselected_device_is_attached() {
    let (base, handle) = start(local_target(), timeouts()).await;
    let client = reqwest::Client::new();

    let response = discover(&client, &base).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/x-shellscript"
    );
    assert_eq!(response.text().await.unwrap(), SCRIPT);

    // the script is handed out once
    assert_eq!(discover(&client, &base).await.status(), StatusCode::NO_CONTENT);

    assert_eq!(respond(&client, &base, "Installing ssh keys...").await, StatusCode::OK);
    assert_eq!(respond(&client, &base, COMPLETION_MARKER).await, StatusCode::OK);

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.hostname(), Some("node-a"));
    assert_eq!(report.get("wg_public"), Some("NODEPUB="));
    assert_eq!(report.address.to_string(), "127.0.0.1");
}

#[tokio::test]
async fn device_bodies_are_read_without_form_content_type() {
    let (base, handle) = start(local_target(), timeouts()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/bootstrap/"))
        .header("content-type", "text/plain")
        .body("hostname=node-a&mac=02%3A00%3A00%3A00%3A00%3A05&wg_public=NODEPUB%3D")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), SCRIPT);

    let status = client
        .post(format!("{base}/bootstrap/response/"))
        .body(format!("text={}", COMPLETION_MARKER.replace(' ', "+")))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, StatusCode::OK);

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.get("wg_public"), Some("NODEPUB="));
}

#[tokio::test]
async fn other_devices_are_not_served() {
    let mode = Mode::Preselected(Target {
        address: "192.0.2.200".parse().unwrap(),
        mac: None,
    });
    let short = Timeouts {
        offering: Duration::from_millis(400),
        ..timeouts()
    };
    let (base, handle) = start(mode, short).await;
    let client = reqwest::Client::new();

    assert_eq!(discover(&client, &base).await.status(), StatusCode::NO_CONTENT);
    assert_eq!(respond(&client, &base, COMPLETION_MARKER).await, StatusCode::NO_CONTENT);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ProtocolTimeout { .. }));
}

#[tokio::test]
async fn unknown_paths_and_methods_are_not_found() {
    let (base, handle) = start(local_target(), timeouts()).await;
    let client = reqwest::Client::new();

    let get = client.get(format!("{base}/bootstrap/")).send().await.unwrap();
    assert_eq!(get.status(), StatusCode::NOT_FOUND);
    let other = client
        .post(format!("{base}/status/"))
        .form(&[("text", "x")])
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::NOT_FOUND);

    handle.abort();
}

#[tokio::test]
async fn gathered_device_is_chosen_and_attached() {
    let chooser: wgmesh_attach::session::Chooser = Box::new(|devices: &[DeviceReport]| {
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].hostname(), Some("node-a"));
        Ok(0)
    });
    let (base, handle) = start(Mode::Interactive(chooser), timeouts()).await;
    let client = reqwest::Client::new();

    // recorded while gathering, answered 204
    assert_eq!(discover(&client, &base).await.status(), StatusCode::NO_CONTENT);

    let mut served = false;
    for _ in 0..40 {
        let response = discover(&client, &base).await;
        if response.status() == StatusCode::OK {
            served = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(served);
    assert_eq!(respond(&client, &base, COMPLETION_MARKER).await, StatusCode::OK);

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.mac(), Some("02:00:00:00:00:05"));
}

#[tokio::test]
async fn cancelled_selection_stops_the_session() {
    let chooser: wgmesh_attach::session::Chooser =
        Box::new(|_: &[DeviceReport]| Err(Error::Cancelled("no".to_string())));
    let (base, handle) = start(Mode::Interactive(chooser), timeouts()).await;
    let client = reqwest::Client::new();
    discover(&client, &base).await;

    assert!(matches!(
        handle.await.unwrap(),
        Err(Error::Cancelled(_))
    ));
}

#[tokio::test]
async fn empty_gathering_times_out() {
    let chooser: wgmesh_attach::session::Chooser = Box::new(|_: &[DeviceReport]| Ok(0));
    let (_base, handle) = start(Mode::Interactive(chooser), timeouts()).await;
    assert!(matches!(
        handle.await.unwrap(),
        Err(Error::ProtocolTimeout { .. })
    ));
}
