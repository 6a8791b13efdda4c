//! Producer/consumer flip-ack scenarios.

use fusion_config::FusionConfig;
use fusion_surface::{FlipFlags, SurfaceClient, SurfaceConfig, SurfaceStore};
use std::sync::Arc;
use std::time::Duration;

fn config() -> FusionConfig {
    FusionConfig::default()
}

#[test]
fn double_buffer_back_pressure() {
    let store = SurfaceStore::new();
    let surface = store.create(SurfaceConfig::new(64, 64, 2)).unwrap();
    let client = SurfaceClient::new(surface.clone(), &config());

    // First flip does not block: one frame may be in flight.
    client.flip(None, FlipFlags::empty()).unwrap();
    assert_eq!(client.local_flip_count(), 1);
    assert!(client.would_block());

    // Second flip must block until the consumer acks frame 1.
    let blocked = {
        let client = client.clone();
        std::thread::spawn(move || {
            client.flip(None, FlipFlags::empty()).unwrap();
            client.local_flip_count()
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished(), "second flip should be blocked");

    surface.frame_ack(1);
    let flips = blocked.join().unwrap();
    assert_eq!(flips, 2);
    assert_eq!(client.frame_ack(), 1);
}

#[test]
fn nowait_flip_never_blocks() {
    let store = SurfaceStore::new();
    let surface = store.create(SurfaceConfig::new(64, 64, 2)).unwrap();
    let client = SurfaceClient::new(surface, &config());

    for _ in 0..5 {
        client.flip(None, FlipFlags::NOWAIT).unwrap();
    }
    assert_eq!(client.local_flip_count(), 5);
}

#[test]
fn triple_buffer_catch_up() {
    let store = SurfaceStore::new();
    let surface = store.create(SurfaceConfig::new(64, 64, 3)).unwrap();
    let client = SurfaceClient::new(surface.clone(), &config());

    // Two flips fit in flight with three buffers.
    client.flip(None, FlipFlags::empty()).unwrap();
    client.flip(None, FlipFlags::empty()).unwrap();
    assert!(client.would_block());

    // Consumer skips frame 1 and acks 2 directly; the third flip
    // proceeds.
    let third = {
        let client = client.clone();
        std::thread::spawn(move || client.flip(None, FlipFlags::empty()))
    };
    surface.frame_ack(2);
    third.join().unwrap().unwrap();

    assert_eq!(client.frame_ack(), 2);
    assert_eq!(client.local_flip_count(), 3);
    // Next flip needs ack >= 2, already satisfied.
    assert!(!client.would_block());
}

#[test]
fn single_buffer_never_waits() {
    let store = SurfaceStore::new();
    let surface = store.create(SurfaceConfig::new(64, 64, 1)).unwrap();
    let client = SurfaceClient::new(surface, &config());
    for _ in 0..3 {
        client.flip(None, FlipFlags::empty()).unwrap();
    }
    // Single-buffered surfaces have no FLIPPING cap; the count stays.
    assert_eq!(client.local_flip_count(), 0);
}

#[test]
fn update_flag_presents_without_advancing() {
    let store = SurfaceStore::new();
    let surface = store.create(SurfaceConfig::new(64, 64, 2)).unwrap();
    let client = SurfaceClient::new(surface.clone(), &config());

    client
        .flip(None, FlipFlags::UPDATE | FlipFlags::NOWAIT)
        .unwrap();
    assert_eq!(client.local_flip_count(), 0);

    let updates = surface.take_updates();
    assert_eq!(updates.len(), 1);
    assert!(!updates[0].flip);
}

#[test]
fn stereo_flip_advances_once_with_two_updates() {
    use fusion_surface::{Eye, SurfaceCaps};

    let store = SurfaceStore::new();
    let mut surface_config = SurfaceConfig::new(64, 64, 2);
    surface_config.caps |= SurfaceCaps::STEREO;
    let surface = store.create(surface_config).unwrap();
    let client = SurfaceClient::new(surface.clone(), &config());

    client
        .flip_stereo(None, None, FlipFlags::NOWAIT)
        .unwrap();
    assert_eq!(client.local_flip_count(), 1);

    let updates = surface.take_updates();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].eye, Eye::Left);
    assert_eq!(updates[1].eye, Eye::Right);
    assert_eq!(updates[0].flip_count, updates[1].flip_count);
}

#[test]
fn stereo_flip_on_mono_surface_is_unsupported() {
    let store = SurfaceStore::new();
    let surface = store.create(SurfaceConfig::new(64, 64, 2)).unwrap();
    let client = SurfaceClient::new(surface, &config());
    assert!(client
        .flip_stereo(None, None, FlipFlags::NOWAIT)
        .is_err());
}

#[test]
fn stale_ack_never_lowers_frame_ack() {
    let store = SurfaceStore::new();
    let surface = store.create(SurfaceConfig::new(64, 64, 3)).unwrap();
    let client = SurfaceClient::new(surface.clone(), &config());

    client.flip(None, FlipFlags::NOWAIT).unwrap();
    client.flip(None, FlipFlags::NOWAIT).unwrap();
    surface.frame_ack(2);
    surface.frame_ack(1);
    assert_eq!(client.frame_ack(), 2);
    assert_eq!(surface.flips_acked(), 2);
}

#[test]
fn missed_flips_promote_local_count() {
    let store = SurfaceStore::new();
    let surface = store.create(SurfaceConfig::new(64, 64, 2)).unwrap();
    let client: Arc<SurfaceClient> = SurfaceClient::new(surface.clone(), &config());

    // An ack beyond anything we flipped means another producer flipped;
    // our local count follows.
    surface.frame_ack(7);
    assert_eq!(client.local_flip_count(), 7);
    assert_eq!(client.frame_ack(), 7);
}
