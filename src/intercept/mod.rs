//! Interception layer: which surfaces are trapped, and how a trapped access
//! is turned into a real, absent or substitute result.
//!
//! Host-object patching lives behind the [`Interceptor`] trait. The browser
//! implementation is [`dom::DomInterceptor`]; [`sandbox::SandboxHost`] is an
//! in-memory host with the same contract, so the whole engine can be driven
//! without a DOM.

use std::collections::HashSet;
use std::rc::Rc;

use crate::attribute::AttributeId;
use crate::config::SurfaceConfig;
use crate::error::Result;
use crate::ledger::ScriptOrigin;
use crate::policy::{DecisionPolicy, Resolution};
use crate::profile::{attrs, RandomProfile};

pub mod dom;
mod js_helpers;
pub mod sandbox;

/// Surface groups, each toggled by one [`SurfaceConfig`] flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceGroup {
    Navigator,
    Screen,
    Canvas,
    WebGl,
    History,
    Geometry,
    Storage,
    Permissions,
    Fonts,
    Audio,
}

impl SurfaceGroup {
    pub fn enabled(&self, config: &SurfaceConfig) -> bool {
        match self {
            SurfaceGroup::Navigator => config.navigator,
            SurfaceGroup::Screen => config.screen,
            SurfaceGroup::Canvas => config.canvas,
            SurfaceGroup::WebGl => config.webgl,
            SurfaceGroup::History => config.history,
            SurfaceGroup::Geometry => config.geometry,
            SurfaceGroup::Storage => config.storage,
            SurfaceGroup::Permissions => config.permissions,
            SurfaceGroup::Fonts => config.fonts,
            SurfaceGroup::Audio => config.audio,
        }
    }
}

/// Where a trapped member lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Holder {
    /// A global instance, e.g. `navigator`.
    Global(&'static str),
    /// A constructor's prototype, e.g. `HTMLCanvasElement.prototype`.
    Prototype(&'static str),
}

impl Holder {
    /// Object name used in attribute ids.
    pub fn name(&self) -> &'static str {
        match self {
            Holder::Global(name) | Holder::Prototype(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    Named(&'static str),
    /// Every non-function enumerable member, own and inherited.
    AllProperties { exclude: &'static [&'static str] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Accessor trap: reads and writes.
    Property,
    /// Call trap on a synchronous method.
    Method,
    /// Call trap on a method that returns a Promise.
    AsyncMethod,
    /// `getParameter`-style call trap; the argument selects the attribute.
    Parameter,
}

/// One catalog row.
#[derive(Debug, Clone, Copy)]
pub struct Surface {
    pub group: SurfaceGroup,
    pub holder: Holder,
    pub member: Member,
    pub kind: TrapKind,
}

/// WebGL context members that are never trapped.
pub const WEBGL_EXCLUDED: &[&str] = &["canvas", "drawingBufferWidth", "drawingBufferHeight"];

const WEBGL_CONTEXTS: [&str; 2] = ["WebGLRenderingContext", "WebGL2RenderingContext"];

const fn named(group: SurfaceGroup, holder: Holder, member: &'static str, kind: TrapKind) -> Surface {
    Surface {
        group,
        holder,
        member: Member::Named(member),
        kind,
    }
}

const fn all_properties(
    group: SurfaceGroup,
    holder: Holder,
    exclude: &'static [&'static str],
) -> Surface {
    Surface {
        group,
        holder,
        member: Member::AllProperties { exclude },
        kind: TrapKind::Property,
    }
}

/// Every monitored surface.
pub const CATALOG: &[Surface] = {
    use Holder::{Global, Prototype};
    use SurfaceGroup::*;
    use TrapKind::*;
    &[
        all_properties(Navigator, Global("navigator"), &[]),
        all_properties(Screen, Global("screen"), &[]),
        named(Canvas, Prototype("HTMLCanvasElement"), "toDataURL", Method),
        named(WebGl, Prototype(WEBGL_CONTEXTS[0]), "getParameter", Parameter),
        named(WebGl, Prototype(WEBGL_CONTEXTS[1]), "getParameter", Parameter),
        all_properties(WebGl, Prototype(WEBGL_CONTEXTS[0]), WEBGL_EXCLUDED),
        all_properties(WebGl, Prototype(WEBGL_CONTEXTS[1]), WEBGL_EXCLUDED),
        named(WebGl, Prototype("WebGLShaderPrecisionFormat"), "precision", Property),
        named(WebGl, Prototype("WebGLShaderPrecisionFormat"), "rangeMin", Property),
        named(WebGl, Prototype("WebGLShaderPrecisionFormat"), "rangeMax", Property),
        named(History, Global("history"), "length", Property),
        named(Geometry, Prototype("HTMLElement"), "offsetWidth", Property),
        named(Geometry, Prototype("HTMLElement"), "offsetHeight", Property),
        named(Storage, Prototype("StorageManager"), "estimate", AsyncMethod),
        named(Permissions, Prototype("Permissions"), "query", AsyncMethod),
        named(Permissions, Prototype("PermissionStatus"), "state", Property),
        named(Fonts, Prototype("FontFaceSet"), "check", Method),
        named(Audio, Prototype("BaseAudioContext"), "sampleRate", Property),
        named(Audio, Prototype("AudioContext"), "baseLatency", Property),
        named(Audio, Prototype("AudioContext"), "outputLatency", Property),
        named(Audio, Prototype("AudioDestinationNode"), "maxChannelCount", Property),
        named(Audio, Prototype("AudioNode"), "channelCount", Property),
    ]
};

/// `getParameter` enums that are monitored, by constant name.
pub const WEBGL_PARAMETERS: &[(u32, &str)] = &[
    (0x1F00, "VENDOR"),
    (0x1F01, "RENDERER"),
    (0x1F02, "VERSION"),
    (0x8B8C, "SHADING_LANGUAGE_VERSION"),
    (0x9245, "UNMASKED_VENDOR_WEBGL"),
    (0x9246, "UNMASKED_RENDERER_WEBGL"),
    (0x0D33, "MAX_TEXTURE_SIZE"),
    (0x0D3A, "MAX_VIEWPORT_DIMS"),
    (0x84E8, "MAX_RENDERBUFFER_SIZE"),
    (0x851C, "MAX_CUBE_MAP_TEXTURE_SIZE"),
    (0x8869, "MAX_VERTEX_ATTRIBS"),
    (0x8872, "MAX_TEXTURE_IMAGE_UNITS"),
    (0x8B4D, "MAX_COMBINED_TEXTURE_IMAGE_UNITS"),
    (0x8DFB, "MAX_VERTEX_UNIFORM_VECTORS"),
    (0x8DFC, "MAX_VARYING_VECTORS"),
    (0x8DFD, "MAX_FRAGMENT_UNIFORM_VECTORS"),
    (0x846D, "ALIASED_POINT_SIZE_RANGE"),
    (0x846E, "ALIASED_LINE_WIDTH_RANGE"),
];

/// Attribute for `context.getParameter(pname)`, or `None` for parameters
/// that are passed through unmonitored.
pub fn webgl_parameter_attribute(context: &str, pname: u32) -> Option<AttributeId> {
    WEBGL_PARAMETERS
        .iter()
        .find(|(value, _)| *value == pname)
        .map(|(_, name)| AttributeId::new(context, name))
}

/// Answer `FontFaceSet.check(spec)` from a substitute font list: true when
/// the font string names one of the listed families.
pub fn font_check_answer(fonts: &[String], spec: &str) -> bool {
    let spec = spec.to_ascii_lowercase();
    spec.split(',')
        .map(|part| {
            part.split_whitespace()
                .skip_while(|token| {
                    let t = token.trim_matches(|c| c == '"' || c == '\'');
                    t.chars().next().map_or(false, |c| c.is_ascii_digit())
                        || matches!(t, "italic" | "bold" | "normal" | "oblique" | "small-caps")
                })
                .collect::<Vec<_>>()
                .join(" ")
                .trim_matches(|c| c == '"' || c == '\'')
                .to_string()
        })
        .any(|family| {
            !family.is_empty() && fonts.iter().any(|f| f.to_ascii_lowercase() == family)
        })
}

/// Whether an attribute is a method whose result is a Promise.
pub fn is_async_attribute(attribute: &AttributeId) -> bool {
    matches!(
        attribute.as_str(),
        attrs::STORAGE_ESTIMATE | attrs::PERMISSIONS_QUERY
    )
}

/// A concrete trap to install.
#[derive(Debug, Clone)]
pub struct Trap {
    pub group: SurfaceGroup,
    pub holder: Holder,
    pub member: String,
    pub attribute: AttributeId,
    pub kind: TrapKind,
}

/// Routes trapped accesses through the decision policy.
pub struct AccessGate {
    policy: Rc<DecisionPolicy>,
    /// Random mode snapshot; `None` in Entropy mode.
    profile: Option<Rc<RandomProfile>>,
}

impl AccessGate {
    pub fn new(policy: Rc<DecisionPolicy>, profile: Option<Rc<RandomProfile>>) -> Self {
        Self { policy, profile }
    }

    pub fn policy(&self) -> &Rc<DecisionPolicy> {
        &self.policy
    }

    pub fn profile(&self) -> Option<&RandomProfile> {
        self.profile.as_deref()
    }

    /// A property read.
    pub fn read(&self, attribute: &AttributeId, origin: &ScriptOrigin) -> Resolution {
        self.policy
            .decide(attribute, origin)
            .resolve(self.profile.as_deref(), attribute)
    }

    /// A method call. `Absent` means the original must not be invoked.
    pub fn call(&self, attribute: &AttributeId, origin: &ScriptOrigin) -> Resolution {
        self.read(attribute, origin)
    }

    /// A property write. Returns whether the write may take effect.
    pub fn write(&self, attribute: &AttributeId, origin: &ScriptOrigin) -> bool {
        !matches!(self.read(attribute, origin), Resolution::Absent)
    }
}

/// Host capability: install traps, attribute accesses, undo.
pub trait Interceptor {
    /// Non-function enumerable member names (own and inherited) of `holder`.
    fn list_properties(&self, holder: &Holder) -> Result<Vec<String>>;

    /// Install one trap. Absent holders or members are `SurfaceUnavailable`.
    fn install(&mut self, trap: &Trap, gate: Rc<AccessGate>) -> Result<()>;

    /// Origin of the currently executing script.
    fn attribute(&self) -> ScriptOrigin;

    /// Remove every installed trap. Returns how many were removed.
    fn restore(&mut self) -> usize;
}

/// Outcome of installing the catalog on one host.
#[derive(Debug, Default, Clone)]
pub struct InstallReport {
    pub installed: Vec<AttributeId>,
    pub skipped: Vec<String>,
}

/// The catalog installed on a host.
pub struct InterceptionLayer<I: Interceptor> {
    interceptor: I,
    report: InstallReport,
}

impl<I: Interceptor> InterceptionLayer<I> {
    /// Install every enabled surface. Surfaces the host lacks are skipped;
    /// installation itself never fails.
    pub fn install(mut interceptor: I, config: &SurfaceConfig, gate: Rc<AccessGate>) -> Self {
        let mut report = InstallReport::default();
        let mut seen = HashSet::new();

        for surface in CATALOG.iter().filter(|s| s.group.enabled(config)) {
            for trap in expand(&interceptor, surface, &mut report) {
                if !seen.insert((trap.holder, trap.member.clone())) {
                    continue;
                }
                match interceptor.install(&trap, gate.clone()) {
                    Ok(()) => report.installed.push(trap.attribute),
                    Err(e) => {
                        log::debug!("Skipping {}: {}", trap.attribute, e);
                        report.skipped.push(trap.attribute.to_string());
                    }
                }
            }
        }

        log::info!(
            "Interception installed: {} traps, {} skipped",
            report.installed.len(),
            report.skipped.len()
        );
        Self {
            interceptor,
            report,
        }
    }

    pub fn report(&self) -> &InstallReport {
        &self.report
    }

    pub fn interceptor(&self) -> &I {
        &self.interceptor
    }

    pub fn interceptor_mut(&mut self) -> &mut I {
        &mut self.interceptor
    }

    pub fn restore(&mut self) -> usize {
        let removed = self.interceptor.restore();
        self.report.installed.clear();
        removed
    }
}

fn expand<I: Interceptor>(
    interceptor: &I,
    surface: &Surface,
    report: &mut InstallReport,
) -> Vec<Trap> {
    let object = surface.holder.name();
    let trap = |member: &str| Trap {
        group: surface.group,
        holder: surface.holder,
        member: member.to_string(),
        attribute: AttributeId::new(object, member),
        kind: surface.kind,
    };

    match surface.member {
        Member::Named(member) => vec![trap(member)],
        Member::AllProperties { exclude } => match interceptor.list_properties(&surface.holder) {
            Ok(members) => members
                .iter()
                .filter(|m| !exclude.contains(&m.as_str()))
                .map(|m| trap(m))
                .collect(),
            Err(e) => {
                log::debug!("Skipping {}.*: {}", object, e);
                report.skipped.push(format!("{}.*", object));
                Vec::new()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_respects_toggles() {
        let config = SurfaceConfig {
            webgl: false,
            ..SurfaceConfig::default()
        };
        assert!(CATALOG
            .iter()
            .filter(|s| s.group.enabled(&config))
            .all(|s| s.group != SurfaceGroup::WebGl));
        assert!(CATALOG.iter().any(|s| s.group == SurfaceGroup::WebGl));
    }

    #[test]
    fn test_webgl_parameters() {
        assert_eq!(
            webgl_parameter_attribute("WebGLRenderingContext", 0x9246)
                .unwrap()
                .as_str(),
            attrs::WEBGL_UNMASKED_RENDERER
        );
        assert_eq!(
            webgl_parameter_attribute("WebGL2RenderingContext", 0x1F00)
                .unwrap()
                .as_str(),
            attrs::WEBGL2_VENDOR
        );
        assert!(webgl_parameter_attribute("WebGLRenderingContext", 0x0B71).is_none());
    }

    #[test]
    fn test_font_check() {
        let fonts = vec!["Arial".to_string(), "Courier New".to_string()];
        assert!(font_check_answer(&fonts, "12px Arial"));
        assert!(font_check_answer(&fonts, "bold 16px \"Courier New\""));
        assert!(font_check_answer(&fonts, "10px Wingdings, arial"));
        assert!(!font_check_answer(&fonts, "12px Wingdings"));
        assert!(!font_check_answer(&fonts, ""));
    }

    #[test]
    fn test_async_attributes() {
        assert!(is_async_attribute(&attrs::STORAGE_ESTIMATE.into()));
        assert!(!is_async_attribute(&attrs::FONTS_CHECK.into()));
    }
}
