//! Named-operation dispatcher for the host.
//!
//! Every call takes an operation name and a JSON argument object and
//! answers with a string: `"ok"`, a status token such as
//! `"out_of_bounds"`, a JSON payload, or `"error:<message>"`.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::canvas::{BlendMode, Rect, parse_hex_color};
use crate::error::EngineError;
use crate::io::png_data_url;
use crate::project::PainterSession;

pub const OK: &str = "ok";
pub const NO_SELECTION: &str = "no_selection";
pub const UNKNOWN_COMMAND: &str = "error:unknown command";

/// Operation names accepted by [`CommandBus::dispatch`].
pub const COMMAND_NAMES: &[&str] = &[
    "add_layer",
    "remove_layer",
    "duplicate_layer",
    "rename_layer",
    "set_opacity",
    "set_blend_mode",
    "toggle_visibility",
    "set_current_layer",
    "merge_down",
    "flatten",
    "fill",
    "clear",
    "undo",
    "redo",
    "begin_transform",
    "commit_transform",
    "cancel_transform",
    "thumbnail",
    "load",
    "save",
    "select_rect",
    "select_all",
    "clear_selection",
    "magic_wand",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    AddLayer {
        #[serde(default)]
        name: Option<String>,
    },
    RemoveLayer {
        index: usize,
    },
    DuplicateLayer {
        index: usize,
    },
    RenameLayer {
        index: usize,
        name: String,
    },
    SetOpacity {
        index: usize,
        opacity: f32,
    },
    SetBlendMode {
        index: usize,
        mode: BlendMode,
    },
    ToggleVisibility {
        index: usize,
    },
    SetCurrentLayer {
        index: usize,
    },
    MergeDown {
        index: usize,
    },
    Flatten,
    Fill {
        color: String,
        #[serde(default)]
        rect: Option<Rect>,
    },
    Clear {
        #[serde(default)]
        rect: Option<Rect>,
    },
    Undo,
    Redo,
    BeginTransform,
    /// Optional values override the overlay's current offset, scale and
    /// rotation (radians) before it is applied.
    CommitTransform {
        #[serde(default)]
        offset: Option<(f32, f32)>,
        #[serde(default)]
        scale: Option<f32>,
        #[serde(default)]
        rotation: Option<f32>,
    },
    CancelTransform,
    Thumbnail {
        #[serde(default)]
        max_edge: Option<u32>,
    },
    Load {
        path: PathBuf,
    },
    Save {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    SelectRect {
        rect: Rect,
    },
    SelectAll,
    ClearSelection,
    MagicWand {
        x: u32,
        y: u32,
    },
}

impl Command {
    /// Build a command from its name and argument bag. `Null` counts as
    /// no arguments.
    pub fn parse(name: &str, args: &Value) -> Result<Command, String> {
        if !COMMAND_NAMES.contains(&name) {
            return Err(UNKNOWN_COMMAND.to_string());
        }
        let mut bag = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => return Err("error:arguments must be an object".to_string()),
        };
        bag.insert("op".to_string(), Value::String(name.to_string()));
        serde_json::from_value(Value::Object(bag)).map_err(|e| format!("error:{}", e))
    }
}

fn status(result: Result<(), EngineError>) -> String {
    match result {
        Ok(()) => OK.to_string(),
        Err(e) => {
            log::debug!("command failed: {}", e);
            e.status().to_string()
        }
    }
}

/// Stateless dispatcher; the session is passed per call.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandBus;

impl CommandBus {
    pub fn dispatch(&self, session: &mut PainterSession, name: &str, args: &Value) -> String {
        match Command::parse(name, args) {
            Ok(command) => self.execute(session, command),
            Err(reply) => {
                log::warn!("rejected command \"{}\": {}", name, reply);
                reply
            }
        }
    }

    pub fn execute(&self, session: &mut PainterSession, command: Command) -> String {
        log::debug!("command: {:?}", command);
        match command {
            Command::AddLayer { name } => {
                let name = name.unwrap_or_else(|| format!("Layer {}", session.layers().len() + 1));
                status(session.add_layer(&name, None).map(|_| ()))
            }
            Command::RemoveLayer { index } => status(session.remove_layer(index)),
            Command::DuplicateLayer { index } => status(session.duplicate_layer(index).map(|_| ())),
            Command::RenameLayer { index, name } => status(session.rename_layer(index, &name)),
            Command::SetOpacity { index, opacity } => status(session.set_layer_opacity(index, opacity)),
            Command::SetBlendMode { index, mode } => status(session.set_blend_mode(index, mode)),
            Command::ToggleVisibility { index } => status(session.toggle_visibility(index).map(|_| ())),
            Command::SetCurrentLayer { index } => status(session.set_current_layer(index)),
            Command::MergeDown { index } => status(session.merge_down(index)),
            Command::Flatten => status(session.flatten()),
            Command::Fill { color, rect } => match parse_hex_color(&color) {
                Some(c) => status(session.fill(c, rect)),
                None => format!("error:invalid color \"{}\"", color),
            },
            Command::Clear { rect } => status(session.clear(rect)),
            Command::Undo => status(session.undo().map(|_| ())),
            Command::Redo => status(session.redo().map(|_| ())),
            Command::BeginTransform => status(session.begin_transform()),
            Command::CommitTransform { offset, scale, rotation } => {
                let Some(overlay) = session.transform_mut() else {
                    return EngineError::SurfaceUnavailable.status().to_string();
                };
                if let Some(o) = offset {
                    overlay.offset = o;
                }
                if let Some(s) = scale.filter(|s| s.is_finite() && *s > 0.0) {
                    overlay.scale = s;
                }
                if let Some(r) = rotation.filter(|r| r.is_finite()) {
                    overlay.rotation = r;
                }
                status(session.commit_transform().map(|_| ()))
            }
            Command::CancelTransform => status(session.cancel_transform()),
            Command::Thumbnail { max_edge } => {
                let thumb = match max_edge {
                    Some(edge) => session.layers().composite_scaled(edge.max(1)),
                    None => session.thumbnail(),
                };
                match png_data_url(&thumb) {
                    Ok(url) => json!({
                        "width": thumb.width(),
                        "height": thumb.height(),
                        "data_url": url,
                    })
                    .to_string(),
                    Err(e) => format!("error:{}", e),
                }
            }
            Command::Load { path } => match session.open(&path) {
                Ok(()) => OK.to_string(),
                Err(e) => format!("error:{}", e),
            },
            Command::Save { path } => {
                let result = match path {
                    Some(p) => session.save_as(&p),
                    None => session.save().map(|_| ()),
                };
                match result {
                    Ok(()) => OK.to_string(),
                    Err(e) => format!("error:{}", e),
                }
            }
            Command::SelectRect { rect } => match session.select_rect(rect) {
                Ok(true) => OK.to_string(),
                Ok(false) => NO_SELECTION.to_string(),
                Err(e) => e.status().to_string(),
            },
            Command::SelectAll => status(session.select_all()),
            Command::ClearSelection => status(session.clear_selection().map(|_| ())),
            Command::MagicWand { x, y } => match session.magic_wand_at(x, y) {
                Ok(true) => OK.to_string(),
                Ok(false) => NO_SELECTION.to_string(),
                Err(e) => e.status().to_string(),
            },
        }
    }
}
