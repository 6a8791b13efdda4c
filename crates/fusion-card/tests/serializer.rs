//! Serializer behavior against a recording mock driver.

use fusion_card::{
    AccelMask, CardCaps, CardCapsFlags, CardState, GraphicsCore, GraphicsDriver, LockFlags,
    NullRasterizer, SoftwareRasterizer,
};
use fusion_config::FusionConfig;
use fusion_protocol::{FusionError, Result};
use fusion_surface::{Rectangle, Region, SurfaceConfig, SurfaceStore, Triangle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    CheckState(u32),
    SetState(u32),
    Fill(Rectangle),
    Line(fusion_surface::Line),
    Blit(Rectangle, i32, i32),
    Stretch(Rectangle, Rectangle),
    Emit,
    Sync,
    Reset,
    Invalidate,
}

#[derive(Default)]
struct MockDriver {
    events: Mutex<Vec<Event>>,
    /// Primitives the "hardware" accelerates.
    accept: AccelMask,
    /// Refuse fills after this many calls (usize::MAX = never).
    refuse_fill_after: AtomicUsize,
    fail_sync: AtomicBool,
}

impl MockDriver {
    fn new(accept: AccelMask) -> Arc<Self> {
        Arc::new(MockDriver {
            events: Mutex::new(Vec::new()),
            accept,
            refuse_fill_after: AtomicUsize::new(usize::MAX),
            fail_sync: AtomicBool::new(false),
        })
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| f(e)).count()
    }
}

impl GraphicsDriver for MockDriver {
    fn caps(&self) -> CardCaps {
        CardCaps {
            flags: CardCapsFlags::empty(),
            clip: AccelMask::empty(),
        }
    }

    fn check_state(&self, state: &mut CardState, accel: AccelMask) {
        self.events.lock().push(Event::CheckState(accel.bits()));
        state.accel |= self.accept & accel;
    }

    fn set_state(&self, _state: &mut CardState, accel: AccelMask) {
        self.events.lock().push(Event::SetState(accel.bits()));
    }

    fn fill_rectangle(&self, rect: &Rectangle) -> bool {
        let remaining = self.refuse_fill_after.load(Ordering::SeqCst);
        if remaining == 0 {
            return false;
        }
        if remaining != usize::MAX {
            self.refuse_fill_after.store(remaining - 1, Ordering::SeqCst);
        }
        self.events.lock().push(Event::Fill(*rect));
        true
    }

    fn draw_line(&self, line: &fusion_surface::Line) -> bool {
        self.events.lock().push(Event::Line(*line));
        true
    }

    fn blit(&self, rect: &Rectangle, x: i32, y: i32) -> bool {
        self.events.lock().push(Event::Blit(*rect, x, y));
        true
    }

    fn stretch_blit(&self, src: &Rectangle, dst: &Rectangle) -> bool {
        self.events.lock().push(Event::Stretch(*src, *dst));
        true
    }

    fn emit_commands(&self) {
        self.events.lock().push(Event::Emit);
    }

    fn engine_sync(&self) -> Result<()> {
        self.events.lock().push(Event::Sync);
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(FusionError::Fusion("engine hang".into()));
        }
        Ok(())
    }

    fn engine_reset(&self) {
        self.events.lock().push(Event::Reset);
    }

    fn invalidate_state(&self) {
        self.events.lock().push(Event::Invalidate);
    }
}

#[derive(Default)]
struct CountingRasterizer {
    fills: AtomicUsize,
}

impl SoftwareRasterizer for CountingRasterizer {
    fn acquire(&self, _state: &CardState, _accel: AccelMask) -> bool {
        true
    }
    fn fill_rectangle(&self, _state: &CardState, _rect: &Rectangle) {
        self.fills.fetch_add(1, Ordering::SeqCst);
    }
    fn release(&self, _state: &CardState) {}
}

fn core_with(driver: Arc<MockDriver>) -> (GraphicsCore, Arc<CountingRasterizer>) {
    let software = Arc::new(CountingRasterizer::default());
    let core = GraphicsCore::private(FusionConfig::default(), Some(driver), software.clone())
        .unwrap();
    (core, software)
}

fn drawing_state(core: &GraphicsCore, store: &SurfaceStore) -> CardState {
    let surface = store.create(SurfaceConfig::new(100, 100, 2)).unwrap();
    let mut state = core.new_state();
    state.set_destination(Some(surface));
    state.set_clip(Region::new(0, 0, 99, 99));
    state
}

#[test]
fn accelerated_fill_goes_to_the_driver() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    let (core, software) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);

    core.fill_rectangles(&mut state, &[Rectangle::new(10, 10, 20, 20)]);

    assert_eq!(driver.count(|e| matches!(e, Event::Fill(_))), 1);
    assert_eq!(software.fills.load(Ordering::SeqCst), 0);
    // Commands are batched, not emitted.
    assert!(core.pending_ops());
    assert_eq!(driver.count(|e| matches!(e, Event::Emit)), 0);
}

#[test]
fn refused_fill_falls_back_to_software() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    driver.refuse_fill_after.store(1, Ordering::SeqCst);
    let (core, software) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);

    let rects = [
        Rectangle::new(0, 0, 10, 10),
        Rectangle::new(20, 20, 10, 10),
        Rectangle::new(40, 40, 10, 10),
    ];
    core.fill_rectangles(&mut state, &rects);

    assert_eq!(driver.count(|e| matches!(e, Event::Fill(_))), 1);
    assert_eq!(software.fills.load(Ordering::SeqCst), 2);
}

#[test]
fn unaccelerated_primitive_never_touches_the_driver_fill() {
    let driver = MockDriver::new(AccelMask::empty());
    let (core, software) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);

    core.fill_rectangles(&mut state, &[Rectangle::new(0, 0, 10, 10)]);

    assert_eq!(driver.count(|e| matches!(e, Event::Fill(_))), 0);
    assert_eq!(software.fills.load(Ordering::SeqCst), 1);
    // The driver was still consulted once.
    assert_eq!(driver.count(|e| matches!(e, Event::CheckState(_))), 1);
}

#[test]
fn set_state_not_reissued_without_modification() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    let (core, _) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);

    core.fill_rectangles(&mut state, &[Rectangle::new(0, 0, 10, 10)]);
    core.fill_rectangles(&mut state, &[Rectangle::new(5, 5, 10, 10)]);
    assert_eq!(driver.count(|e| matches!(e, Event::SetState(_))), 1);

    // A modification forces a new SetState.
    state.set_color(fusion_card::Color {
        a: 255,
        r: 255,
        g: 0,
        b: 0,
    });
    core.fill_rectangles(&mut state, &[Rectangle::new(1, 1, 5, 5)]);
    assert_eq!(driver.count(|e| matches!(e, Event::SetState(_))), 2);
}

#[test]
fn destination_switch_forces_exactly_one_emit() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    let (core, _) = core_with(driver.clone());
    let store = SurfaceStore::new();

    let surface_a = store.create(SurfaceConfig::new(100, 100, 1)).unwrap();
    let surface_b = store.create(SurfaceConfig::new(100, 100, 1)).unwrap();

    let mut state = core.new_state();
    state.set_clip(Region::new(0, 0, 99, 99));

    // Draw to A: commands stay pending.
    state.set_destination(Some(surface_a));
    core.fill_rectangles(&mut state, &[Rectangle::new(0, 0, 10, 10)]);
    assert!(core.pending_ops());
    assert_eq!(driver.count(|e| matches!(e, Event::Emit)), 0);

    // Draw to B: the pending commands for A are emitted exactly once
    // before B's state reaches the hardware.
    state.set_destination(Some(surface_b));
    core.fill_rectangles(&mut state, &[Rectangle::new(0, 0, 10, 10)]);
    assert_eq!(driver.count(|e| matches!(e, Event::Emit)), 1);

    // The emit happened before the second SetState.
    let events = driver.events();
    let emit_at = events.iter().position(|e| matches!(e, Event::Emit)).unwrap();
    let set_states: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, Event::SetState(_)))
        .map(|(at, _)| at)
        .collect();
    assert!(set_states[0] < emit_at && emit_at < set_states[1]);
}

#[test]
fn sync_lock_emits_and_drains() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    let (core, _) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);

    core.fill_rectangles(&mut state, &[Rectangle::new(0, 0, 10, 10)]);
    assert!(core.pending_ops());

    core.lock(LockFlags::SYNC).unwrap();
    core.unlock();

    assert!(!core.pending_ops());
    assert_eq!(driver.count(|e| matches!(e, Event::Emit)), 1);
    assert_eq!(driver.count(|e| matches!(e, Event::Sync)), 1);
}

#[test]
fn failing_sync_resets_engine_and_releases_the_lock() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    driver.fail_sync.store(true, Ordering::SeqCst);
    let (core, _) = core_with(driver.clone());

    assert!(core.lock(LockFlags::SYNC).is_err());
    assert_eq!(driver.count(|e| matches!(e, Event::Reset)), 1);

    // The lock was released on the error path: a plain lock succeeds.
    core.lock(LockFlags::empty()).unwrap();
    core.unlock();
}

#[test]
fn reset_and_invalidate_apply_on_the_next_lock() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    let (core, _) = core_with(driver.clone());

    core.lock(LockFlags::RESET | LockFlags::INVALIDATE).unwrap();
    core.unlock();
    assert_eq!(driver.count(|e| matches!(e, Event::Reset)), 0);

    core.lock(LockFlags::empty()).unwrap();
    core.unlock();
    assert_eq!(driver.count(|e| matches!(e, Event::Reset)), 1);
    assert_eq!(driver.count(|e| matches!(e, Event::Invalidate)), 1);
}

#[test]
fn flush_emits_pending_commands() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    let (core, _) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);

    core.flush().unwrap();
    assert_eq!(driver.count(|e| matches!(e, Event::Emit)), 0);

    core.fill_rectangles(&mut state, &[Rectangle::new(0, 0, 4, 4)]);
    core.flush().unwrap();
    assert_eq!(driver.count(|e| matches!(e, Event::Emit)), 1);
    assert!(!core.pending_ops());
}

#[test]
fn fills_are_clipped_for_hardware_without_clipping_caps() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    let (core, _) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);
    state.set_clip(Region::new(0, 0, 49, 49));

    core.fill_rectangles(&mut state, &[Rectangle::new(40, 40, 30, 30)]);

    let events = driver.events();
    let fill = events
        .iter()
        .find_map(|e| match e {
            Event::Fill(rect) => Some(*rect),
            _ => None,
        })
        .unwrap();
    assert_eq!(fill, Rectangle::new(40, 40, 10, 10));
}

#[test]
fn flat_triangle_draws_zero_rows() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    let (core, software) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);

    let flat = Triangle {
        x1: 0,
        y1: 5,
        x2: 10,
        y2: 5,
        x3: 20,
        y3: 5,
    };
    core.fill_triangles(&mut state, &[flat]);

    assert_eq!(driver.count(|e| matches!(e, Event::Fill(_))), 0);
    assert_eq!(software.fills.load(Ordering::SeqCst), 0);
}

#[test]
fn triangles_fill_as_spans_through_the_rectangle_path() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    let (core, _) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);

    let tri = Triangle {
        x1: 10,
        y1: 10,
        x2: 20,
        y2: 10,
        x3: 10,
        y3: 20,
    };
    core.fill_triangles(&mut state, &[tri]);

    // One span per covered row, all inside the triangle's bounding box.
    let spans: Vec<Rectangle> = driver
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::Fill(rect) => Some(*rect),
            _ => None,
        })
        .collect();
    assert!(!spans.is_empty());
    for span in &spans {
        assert_eq!(span.h, 1);
        assert!(span.y >= 10 && span.y <= 20);
        assert!(span.x >= 10 && span.x + span.w <= 21);
    }
}

#[test]
fn lines_fall_back_to_pixel_spans() {
    let driver = MockDriver::new(AccelMask::empty());
    let (core, software) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);

    core.draw_lines(
        &mut state,
        &[fusion_surface::Line {
            x1: 0,
            y1: 0,
            x2: 4,
            y2: 0,
        }],
    );

    // Five pixels on one row, each a one-pixel fill.
    assert_eq!(software.fills.load(Ordering::SeqCst), 5);
}

#[test]
fn accelerated_lines_are_clipped_client_side() {
    let driver = MockDriver::new(AccelMask::DRAWLINE);
    let (core, software) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);
    state.set_clip(Region::new(0, 0, 9, 9));

    core.draw_lines(
        &mut state,
        &[fusion_surface::Line {
            x1: -5,
            y1: 5,
            x2: 50,
            y2: 5,
        }],
    );

    let line = driver
        .events()
        .iter()
        .find_map(|e| match e {
            Event::Line(line) => Some(*line),
            _ => None,
        })
        .unwrap();
    assert_eq!((line.x1, line.x2), (0, 9));
    assert_eq!(software.fills.load(Ordering::SeqCst), 0);
}

#[test]
fn stretch_blit_prefers_hardware() {
    let driver = MockDriver::new(AccelMask::STRETCHBLIT);
    let (core, _) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);
    let source = store.create(SurfaceConfig::new(32, 32, 1)).unwrap();
    state.set_source(Some(source));

    core.stretch_blit(
        &mut state,
        &Rectangle::new(0, 0, 16, 16),
        &Rectangle::new(10, 10, 32, 32),
    );
    assert_eq!(driver.count(|e| matches!(e, Event::Stretch(_, _))), 1);
}

#[test]
fn blit_requires_a_source() {
    let driver = MockDriver::new(AccelMask::BLIT);
    let (core, _) = core_with(driver.clone());
    let store = SurfaceStore::new();
    let mut state = drawing_state(&core, &store);

    // No source set: validation refuses before any driver contact.
    core.blit(
        &mut state,
        &[Rectangle::new(0, 0, 8, 8)],
        &[fusion_surface::Point { x: 0, y: 0 }],
    );
    assert_eq!(driver.count(|e| matches!(e, Event::CheckState(_))), 0);

    let source = store.create(SurfaceConfig::new(32, 32, 1)).unwrap();
    state.set_source(Some(source));
    core.blit(
        &mut state,
        &[Rectangle::new(0, 0, 8, 8)],
        &[fusion_surface::Point { x: 4, y: 4 }],
    );
    assert_eq!(driver.count(|e| matches!(e, Event::Blit(_, _, _))), 1);
}

#[test]
fn software_only_config_disables_the_driver() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    let software = Arc::new(CountingRasterizer::default());
    let mut config = FusionConfig::default();
    config.software_only = true;
    let core = GraphicsCore::private(config, Some(driver.clone()), software.clone()).unwrap();
    let store = SurfaceStore::new();

    let surface = store.create(SurfaceConfig::new(100, 100, 1)).unwrap();
    let mut state = core.new_state();
    state.set_destination(Some(surface));
    state.set_clip(Region::new(0, 0, 99, 99));

    core.fill_rectangles(&mut state, &[Rectangle::new(0, 0, 10, 10)]);
    assert!(driver.events().is_empty());
    assert_eq!(software.fills.load(Ordering::SeqCst), 1);
}

#[test]
fn emit_early_emits_at_release_and_flush_is_a_noop() {
    let driver = MockDriver::new(AccelMask::FILLRECTANGLE);
    let software = Arc::new(NullRasterizer);
    let mut config = FusionConfig::default();
    config.gfx_emit_early = true;
    let core = GraphicsCore::private(config, Some(driver.clone()), software).unwrap();
    let store = SurfaceStore::new();

    let surface = store.create(SurfaceConfig::new(100, 100, 1)).unwrap();
    let mut state = core.new_state();
    state.set_destination(Some(surface));
    state.set_clip(Region::new(0, 0, 99, 99));

    core.fill_rectangles(&mut state, &[Rectangle::new(0, 0, 10, 10)]);
    assert!(!core.pending_ops());
    assert_eq!(driver.count(|e| matches!(e, Event::Emit)), 1);

    core.flush().unwrap();
    assert_eq!(driver.count(|e| matches!(e, Event::Emit)), 1);
}
