use std::time::{Duration, Instant};

use image::Rgba;
use layerpaint::brush::{BrushEngine, BrushSettings, ColorMixMode, LinearMixer, mix_normal};
use layerpaint::canvas::blend_pixel;
use layerpaint::config::EngineSettings;
use layerpaint::selection::SelectionState;
use layerpaint::{BlendMode, CodecError, EditMode, EngineError, PainterSession, RasterBuffer, Rect, Tool};

const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

fn session() -> PainterSession {
    PainterSession::new_untitled(1, EngineSettings::default())
}

fn split_canvas(s: &mut PainterSession) {
    s.fill(Rgba([0, 0, 0, 255]), Some(Rect::new(0, 0, 400, 600))).unwrap();
    s.fill(Rgba([200, 200, 200, 255]), Some(Rect::new(400, 0, 400, 600))).unwrap();
}

#[test]
fn add_layer_goes_on_top() {
    let mut s = session();
    s.add_layer("L2", None).unwrap();
    assert_eq!(s.layers().len(), 2);
    assert_eq!(s.layers().layers()[0].name, "L2");
    assert_eq!(s.layers().current_index(), 0);
}

#[test]
fn fill_then_undo_restores_blank_layer() {
    let mut s = session();
    let blank = s.canvas().clone();
    s.fill(RED, Some(Rect::new(0, 0, 100, 100))).unwrap();
    assert_eq!(s.layers().current_layer().pixels.pixel(99, 99), RED);
    s.undo().unwrap();
    assert_eq!(s.canvas(), &blank);
    assert_eq!(s.undo(), Err(EngineError::HistoryEmpty));
    assert_eq!(s.canvas(), &blank);
}

#[test]
fn wand_selects_one_half() {
    let mut s = session();
    split_canvas(&mut s);
    s.set_tool(Tool::MagicWand).unwrap();
    s.pointer_down((0.0, 0.0)).unwrap();
    s.pointer_up();
    assert_eq!(s.mode(), EditMode::Idle);
    assert_eq!(s.selection().bounding_rect(), Some(Rect::new(0, 0, 400, 600)));
    assert!(s.selection().contains(399, 300));
    assert!(!s.selection().contains(400, 300));

    // Same seed, same pixels, same mask.
    let first = s.selection().clone();
    s.magic_wand_at(0, 0).unwrap();
    assert_eq!(s.selection(), &first);
}

#[test]
fn merge_down_composites_with_source_layer_settings() {
    let mut s = session();
    let base = Rgba([200, 100, 50, 255]);
    let gray = Rgba([128, 128, 128, 255]);
    s.fill(base, None).unwrap();
    s.add_layer("Shade", Some(RasterBuffer::new_filled(800, 600, gray))).unwrap();
    s.set_layer_opacity(1, 0.5).unwrap();
    s.set_blend_mode(1, BlendMode::Multiply).unwrap();

    s.merge_down(1).unwrap();
    assert_eq!(s.layers().len(), 1);
    assert_eq!(s.layers().layers()[0].name, "Shade");
    let expected = blend_pixel(gray, base, BlendMode::Multiply, 0.5);
    assert_eq!(s.layers().layers()[0].pixels.pixel(10, 10), expected);
    assert_eq!(s.layers().layers()[0].pixels.pixel(799, 599), expected);
}

#[test]
fn removing_the_last_layer_is_refused() {
    let mut s = session();
    assert!(matches!(s.remove_layer(0), Err(EngineError::OutOfBounds { .. })));
    assert_eq!(s.layers().len(), 1);
    assert_eq!(s.history().undo_count(), 0);
}

#[test]
fn opacity_is_always_clamped() {
    let mut s = session();
    for v in [-3.0, 0.25, 1.0, 7.5, f32::INFINITY, f32::NAN] {
        s.set_layer_opacity(0, v).unwrap();
        let o = s.layers().layers()[0].opacity;
        assert!((0.0..=1.0).contains(&o), "{v} -> {o}");
    }
    assert_eq!(s.layers().layers()[0].opacity, 1.0);
}

#[test]
fn flatten_twice_matches_once() {
    let mut s = session();
    s.fill(RED, Some(Rect::new(0, 0, 300, 300))).unwrap();
    s.add_layer("Top", None).unwrap();
    s.fill(BLUE, Some(Rect::new(100, 100, 300, 300))).unwrap();
    s.set_layer_opacity(0, 0.5).unwrap();
    s.set_blend_mode(0, BlendMode::Screen).unwrap();

    s.flatten().unwrap();
    let once = s.layers().composite();
    assert_eq!(s.layers().len(), 1);
    s.flatten().unwrap();
    assert_eq!(s.layers().composite(), once);
}

#[test]
fn lasso_drag_commits_closed_polygon() {
    let mut s = session();
    s.set_tool(Tool::Lasso).unwrap();
    s.pointer_down((10.0, 10.0)).unwrap();
    s.pointer_move((90.0, 20.0));
    s.pointer_move((50.0, 70.0));
    s.pointer_up();
    match s.selection() {
        SelectionState::Lasso(points) => {
            assert_eq!(points.first(), points.last());
            assert_eq!(points.len(), 4);
        }
        other => panic!("expected lasso, got {other:?}"),
    }
    let r = s.selection().bounding_rect().unwrap();
    assert_eq!((r.x, r.y), (10, 10));
    assert!(r.right() >= 90 && r.bottom() >= 70);
}

#[test]
fn undo_redo_law_over_mixed_edits() {
    let mut s = session();
    let start = s.canvas().clone();

    s.set_tool(Tool::Brush).unwrap();
    s.brush_mut().settings.color = BLUE;
    for i in 0..20 {
        match i % 5 {
            0 => {
                s.add_layer(&format!("L{i}"), None).unwrap();
            }
            1 => s.fill(RED, Some(Rect::new(i * 10, i * 5, 40, 40))).unwrap(),
            2 => {
                s.select_rect(Rect::new(i, i, 50, 60)).unwrap();
            }
            3 => {
                s.pointer_down((i as f32 * 7.0, 30.0)).unwrap();
                s.pointer_move((i as f32 * 7.0 + 60.0, 90.0));
                s.pointer_up();
            }
            _ => s.set_layer_opacity(0, 0.3).unwrap(),
        }
    }
    assert_eq!(s.history().undo_count(), 20);
    let end = s.canvas().clone();

    for _ in 0..20 {
        s.undo().unwrap();
    }
    assert_eq!(s.canvas(), &start);
    for _ in 0..20 {
        s.redo().unwrap();
    }
    assert_eq!(s.canvas(), &end);
}

#[test]
fn history_is_capped_at_twenty() {
    let mut s = session();
    for i in 0..25 {
        s.add_layer(&format!("L{i}"), None).unwrap();
    }
    assert_eq!(s.history().undo_count(), 20);
    for _ in 0..20 {
        s.undo().unwrap();
    }
    assert_eq!(s.layers().len(), 6);
    assert_eq!(s.undo(), Err(EngineError::HistoryEmpty));
}

#[test]
fn transform_confirm_is_one_step_and_cancel_is_none() {
    let mut s = session();
    s.fill(RED, Some(Rect::new(0, 0, 20, 20))).unwrap();
    s.select_rect(Rect::new(0, 0, 20, 20)).unwrap();
    let before = s.canvas().clone();
    let undo_before = s.history().undo_count();

    s.begin_transform().unwrap();
    assert_eq!(s.layers().current_layer().pixels.pixel(5, 5)[3], 0);
    s.cancel_transform().unwrap();
    assert_eq!(s.canvas(), &before);
    assert_eq!(s.history().undo_count(), undo_before);

    s.begin_transform().unwrap();
    s.transform_mut().unwrap().offset = (100.0, 0.0);
    s.commit_transform().unwrap();
    assert_eq!(s.history().undo_count(), undo_before + 1);
    let px = &s.layers().current_layer().pixels;
    assert_eq!(px.pixel(110, 10), RED);
    assert_eq!(px.pixel(10, 10)[3], 0);

    s.undo().unwrap();
    assert_eq!(s.canvas(), &before);
}

#[test]
fn transform_drag_through_pointer_routing() {
    let mut s = session();
    s.fill(RED, Some(Rect::new(40, 40, 20, 20))).unwrap();
    s.select_rect(Rect::new(40, 40, 20, 20)).unwrap();
    s.begin_transform().unwrap();
    // Pointer input belongs to the overlay while transforming.
    s.pointer_down((50.0, 50.0)).unwrap();
    s.pointer_move((80.0, 50.0));
    s.pointer_up();
    assert_eq!(s.transform().unwrap().offset, (30.0, 0.0));
    s.commit_transform().unwrap();
    assert_eq!(s.layers().current_layer().pixels.pixel(80, 50), RED);
}

#[test]
fn eraser_clears_pixels() {
    let mut s = session();
    s.fill(RED, None).unwrap();
    s.set_tool(Tool::Eraser).unwrap();
    s.pointer_down((100.0, 100.0)).unwrap();
    s.pointer_move((200.0, 100.0));
    s.pointer_up();
    assert_eq!(s.layers().current_layer().pixels.pixel(150, 100)[3], 0);
    assert_eq!(s.layers().current_layer().pixels.pixel(150, 300), RED);
    assert_eq!(s.history().undo_description(), Some("Eraser"));
}

#[test]
fn spectral_mixer_is_swappable() {
    let mut settings = BrushSettings::default();
    settings.color_mix_mode = ColorMixMode::Spectral;
    let engine = BrushEngine::new(settings, 30).with_spectral_mixer(Box::new(LinearMixer));
    assert_eq!(engine.mix(RED, BLUE, 0.5), mix_normal(RED, BLUE, 0.5));

    let mut s = session();
    *s.brush_mut() = engine;
    s.brush_mut().settings.set_mix_ratio(50);
    s.brush_mut().settings.color = BLUE;
    s.fill(RED, None).unwrap();
    s.set_tool(Tool::Brush).unwrap();
    s.pointer_down((300.0, 300.0)).unwrap();
    s.pointer_up();
    assert_ne!(s.layers().current_layer().pixels.pixel(300, 300), RED);
}

#[test]
fn autosave_debounces_and_batches() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("auto.psd");
    let mut s = session();
    s.set_autosave_path(Some(target.clone()));

    s.add_layer("A", None).unwrap();
    assert!(s.tick(Instant::now()).is_none());
    let later = Instant::now() + Duration::from_millis(2500);
    assert_eq!(s.tick(later).unwrap().unwrap(), target);
    assert!(target.exists());
    assert!(s.tick(later + Duration::from_secs(10)).is_none());

    s.begin_batch();
    s.add_layer("B", None).unwrap();
    s.add_layer("C", None).unwrap();
    assert!(s.tick(Instant::now() + Duration::from_secs(60)).is_none());
    s.end_batch();
    assert!(s.tick(Instant::now() + Duration::from_millis(2500)).unwrap().is_ok());

    let mut reopened = session();
    reopened.open(&target).unwrap();
    let names: Vec<_> = reopened.layers().layers().iter().map(|l| l.name.clone()).collect();
    assert_eq!(names, ["C", "B", "A", "Background"]);
}

#[test]
fn autosave_keeps_the_whole_stroke() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("stroke.psd");
    let mut s = session();
    s.set_autosave_path(Some(target.clone()));
    s.brush_mut().settings.color = RED;
    s.set_tool(Tool::Brush).unwrap();

    let start = Instant::now();
    s.pointer_down((10.0, 10.0)).unwrap();
    // Due, but the stroke is still going.
    assert!(s.tick(start + Duration::from_millis(2500)).is_none());
    assert!(!target.exists());
    s.pointer_move((300.0, 10.0));
    s.pointer_up();
    assert!(s.is_dirty);
    assert_eq!(s.tick(start + Duration::from_secs(60)).unwrap().unwrap(), target);

    let mut reopened = session();
    reopened.open(&target).unwrap();
    let live = s.layers().current_layer().pixels.pixel(200, 10);
    assert_eq!(live, RED);
    assert_eq!(reopened.layers().current_layer().pixels.pixel(200, 10), live);
}

#[test]
fn autosave_reports_an_uncreatable_directory() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();
    let target = blocker.join("nested").join("auto.psd");

    let mut s = session();
    s.set_autosave_path(Some(target.clone()));
    s.add_layer("A", None).unwrap();
    let result = s.tick(Instant::now() + Duration::from_secs(5)).unwrap();
    assert!(matches!(result, Err(CodecError::Io(_))));
    assert!(!target.exists());
    assert!(s.is_dirty);
}

#[test]
fn far_pointer_moves_return_promptly() {
    let mut s = session();
    s.set_tool(Tool::Brush).unwrap();
    s.brush_mut().settings.color = RED;
    s.brush_mut().settings.set_blend_strength(50);

    let started = Instant::now();
    s.pointer_down((10.0, 10.0)).unwrap();
    s.pointer_move((1e12, 10.0));
    s.pointer_move((1e12, 1e12));
    s.pointer_move((f32::NAN, 10.0));
    s.pointer_up();

    // Bleed mode walks the same sampler.
    s.fill(BLUE, Some(Rect::new(0, 100, 800, 20))).unwrap();
    s.brush_mut().settings.set_opacity(0);
    s.pointer_down((10.0, 110.0)).unwrap();
    s.pointer_move((-1e12, 110.0));
    s.pointer_up();
    assert!(started.elapsed() < Duration::from_secs(10));

    let px = &s.layers().current_layer().pixels;
    assert_eq!(px.pixel(700, 10), RED);
    assert_eq!(px.pixel(700, 300)[3], 0);
    assert_eq!(s.mode(), EditMode::Idle);
}

#[test]
fn failed_open_leaves_session_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("bad.psd");
    std::fs::write(&bad, b"8BPS\0\x02garbage").unwrap();

    let mut s = session();
    s.add_layer("Keep", None).unwrap();
    let before = s.canvas().clone();
    assert!(s.open(&bad).is_err());
    assert!(s.open(&dir.path().join("missing.psd")).is_err());
    assert_eq!(s.canvas(), &before);
    assert_eq!(s.history().undo_count(), 1);
    assert!(s.path.is_none());
}

#[test]
fn save_round_trip_keeps_layer_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("painting.psd");
    let mut s = session();
    s.fill(Rgba([10, 200, 30, 255]), None).unwrap();
    s.add_layer("Glaze", None).unwrap();
    s.fill(Rgba([250, 240, 0, 128]), Some(Rect::new(50, 50, 200, 100))).unwrap();
    s.set_layer_opacity(0, 0.6).unwrap();
    s.set_blend_mode(0, BlendMode::Overlay).unwrap();
    s.toggle_visibility(0).unwrap();
    s.save_as(&path).unwrap();
    assert!(!s.is_dirty);
    assert_eq!(s.display_title(), "painting.psd");

    let mut other = session();
    other.open(&path).unwrap();
    assert_eq!((other.canvas().width(), other.canvas().height()), (800, 600));
    for (a, b) in other.layers().layers().iter().zip(s.layers().layers()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.visible, b.visible);
        assert_eq!(a.blend_mode, b.blend_mode);
        assert_eq!((a.opacity * 255.0).round(), (b.opacity * 255.0).round());
        assert_eq!(a.pixels, b.pixels);
    }
    assert!(!other.history().can_undo());
}
