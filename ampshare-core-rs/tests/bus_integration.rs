//! Manager and station services talking over the in-process broker

use std::time::Duration;

use ampshare_core::{
    manager_will, station_will, BusClient, BusEvent, ManagerConfig, ManagerService, MemoryBroker,
    MemoryClient, RegistrySnapshot, StationConfig, StationPhase, StationService, StationSnapshot,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Running<S> {
    client: MemoryClient,
    snapshots: watch::Receiver<S>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Start a manager and wait until it has announced itself online
async fn start_manager(broker: &MemoryBroker) -> Running<RegistrySnapshot> {
    let (probe, mut probe_rx) = broker.connect("probe", None);
    probe.subscribe("services/manager").unwrap();

    let (client, events) = broker.connect("manager", Some(manager_will().unwrap()));
    let service = ManagerService::new(client.clone(), events, ManagerConfig::default());
    let snapshots = service.snapshots();
    let (stop, stop_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let _ = service
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
    });

    let online = BusEvent::Message {
        topic: "services/manager".into(),
        payload: br#"{"online":true}"#.to_vec(),
    };
    loop {
        let event = timeout(WAIT, probe_rx.recv()).await.unwrap().unwrap();
        if event == online {
            break;
        }
    }
    probe.disconnect().unwrap();

    Running {
        client,
        snapshots,
        stop,
        handle,
    }
}

fn start_station(broker: &MemoryBroker, grid: &str, station: &str) -> Running<StationSnapshot> {
    let config = StationConfig::new(grid, station)
        .unwrap()
        .with_tick(Duration::from_millis(20));
    let (client, events) = broker.connect(station, Some(station_will(&config).unwrap()));
    let service = StationService::new(client.clone(), events, config);
    let snapshots = service.snapshots();
    let (stop, stop_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let _ = service
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
    });
    Running {
        client,
        snapshots,
        stop,
        handle,
    }
}

async fn wait_rate(station: &mut Running<StationSnapshot>, rate: u32) {
    timeout(WAIT, station.snapshots.wait_for(|s| s.charge_rate == rate))
        .await
        .expect("timed out waiting for charge rate")
        .expect("station stopped");
}

async fn wait_members(manager: &mut Running<RegistrySnapshot>, grid: &str, count: usize) {
    timeout(
        WAIT,
        manager.snapshots.wait_for(|s| {
            let members = s
                .grids
                .iter()
                .find(|g| g.grid_id == grid)
                .map_or(0, |g| g.stations.len());
            members == count
        }),
    )
    .await
    .expect("timed out waiting for membership")
    .expect("manager stopped");
}

#[tokio::test]
async fn test_two_stations_share_grid() {
    let broker = MemoryBroker::new();
    let mut manager = start_manager(&broker).await;

    let mut s1 = start_station(&broker, "g1", "s1");
    wait_members(&mut manager, "g1", 1).await;
    wait_rate(&mut s1, 32).await;

    let mut s2 = start_station(&broker, "g1", "s2");
    wait_members(&mut manager, "g1", 2).await;
    wait_rate(&mut s1, 30).await;
    wait_rate(&mut s2, 30).await;

    // Crash s1: its will removes it and s2 gets the whole grid
    broker.kill(&s1.client);
    wait_members(&mut manager, "g1", 1).await;
    wait_rate(&mut s2, 32).await;

    // Graceful stop of s2 deletes the grid
    s2.stop.send(()).unwrap();
    s2.handle.await.unwrap();
    timeout(WAIT, manager.snapshots.wait_for(|s| s.grids.is_empty()))
        .await
        .unwrap()
        .unwrap();

    manager.stop.send(()).unwrap();
    manager.handle.await.unwrap();
}

#[tokio::test]
async fn test_station_charges_while_allocated() {
    let broker = MemoryBroker::new();
    let _manager = start_manager(&broker).await;
    let mut s1 = start_station(&broker, "g1", "s1");

    wait_rate(&mut s1, 32).await;
    timeout(WAIT, s1.snapshots.wait_for(|s| s.charge_percent > 1.0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(s1.snapshots.borrow().phase, StationPhase::Charging);
}

#[tokio::test]
async fn test_manager_restart_recovers_membership() {
    let broker = MemoryBroker::new();
    let manager = start_manager(&broker).await;
    let mut s1 = start_station(&broker, "g1", "s1");
    wait_rate(&mut s1, 32).await;

    // Crash: the offline will suspends the station
    broker.kill(&manager.client);
    wait_rate(&mut s1, 0).await;
    assert_eq!(s1.snapshots.borrow().phase, StationPhase::Suspended);
    manager.handle.abort();

    // A fresh manager announces itself and the station re-joins
    let mut manager = start_manager(&broker).await;
    wait_members(&mut manager, "g1", 1).await;
    wait_rate(&mut s1, 32).await;
    assert_eq!(s1.snapshots.borrow().phase, StationPhase::Charging);
}

#[tokio::test]
async fn test_graceful_manager_stop_suspends_stations() {
    let broker = MemoryBroker::new();
    let manager = start_manager(&broker).await;
    let mut s1 = start_station(&broker, "g1", "s1");
    wait_rate(&mut s1, 32).await;

    manager.stop.send(()).unwrap();
    manager.handle.await.unwrap();

    timeout(
        WAIT,
        s1.snapshots
            .wait_for(|s| s.charge_rate == 0 && s.phase == StationPhase::Suspended),
    )
    .await
    .expect("timed out waiting for suspension")
    .expect("station stopped");
    // A clean disconnect carries no will; the notice came from the shutdown path
    assert_eq!(broker.client_count(), 1);
}
