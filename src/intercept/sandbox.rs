//! In-memory host with the same trap contract as the browser.
//!
//! Page scripts are simulated with [`SandboxHost::read`], [`SandboxHost::call`]
//! and friends, after choosing the executing script with
//! [`SandboxHost::run_as`]. `None` stands for `undefined`.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use super::{
    font_check_answer, webgl_parameter_attribute, AccessGate, Holder, Interceptor, Trap, TrapKind,
};
use crate::error::{GuardError, Result};
use crate::ledger::ScriptOrigin;
use crate::policy::Resolution;
use crate::profile::{attrs, SpoofValue};

/// A member of a simulated host object.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMember {
    /// A readable and writable property.
    Data(SpoofValue),
    /// A getter-only accessor (`navigator.userAgent`); writes are ignored.
    Accessor(SpoofValue),
    /// A non-configurable constant (`WebGLRenderingContext.DEPTH_BUFFER_BIT`).
    Constant(SpoofValue),
    /// A method returning the given value.
    Method(SpoofValue),
    /// A method that is never monitored as a property (`navigator.javaEnabled`).
    Function,
}

struct InstalledTrap {
    kind: TrapKind,
    attribute: crate::attribute::AttributeId,
    gate: Rc<AccessGate>,
}

pub struct SandboxHost {
    page_url: String,
    objects: BTreeMap<String, BTreeMap<String, HostMember>>,
    parameters: HashMap<(String, u32), SpoofValue>,
    traps: HashMap<(String, String), InstalledTrap>,
    current_script: Option<String>,
    invocations: RefCell<HashMap<(String, String), u32>>,
    denied: RefCell<Vec<ScriptOrigin>>,
}

impl SandboxHost {
    pub fn new(page_url: impl Into<String>) -> Self {
        Self {
            page_url: page_url.into(),
            objects: BTreeMap::new(),
            parameters: HashMap::new(),
            traps: HashMap::new(),
            current_script: None,
            invocations: RefCell::new(HashMap::new()),
            denied: RefCell::new(Vec::new()),
        }
    }

    /// A host exposing a representative member for every surface group.
    pub fn browser_like(page_url: impl Into<String>) -> Self {
        use HostMember::{Accessor, Constant, Data, Function, Method};
        use SpoofValue::{List, Number, Text};

        let gl = "WebGLRenderingContext";
        Self::new(page_url)
            .with("navigator", "userAgent", Accessor(Text("RealAgent/1.0".into())))
            .with("navigator", "platform", Data(Text("Linux x86_64".into())))
            .with("navigator", "language", Data(Text("nl-NL".into())))
            .with("navigator", "languages", Data(List(vec!["nl-NL".into()])))
            .with("navigator", "hardwareConcurrency", Data(Number(16.0)))
            .with("navigator", "doNotTrack", Data(SpoofValue::Null))
            .with("navigator", "javaEnabled", Function)
            .with("screen", "width", Data(Number(2560.0)))
            .with("screen", "height", Data(Number(1440.0)))
            .with("screen", "colorDepth", Data(Number(30.0)))
            .with("HTMLCanvasElement", "toDataURL", Method(Text("data:image/png;base64,REAL".into())))
            .with(gl, "getParameter", Method(SpoofValue::Null))
            .with(gl, "drawingBufferWidth", Data(Number(300.0)))
            .with(gl, "drawingBufferColorSpace", Data(Text("srgb".into())))
            .with(gl, "DEPTH_BUFFER_BIT", Constant(Number(256.0)))
            .with_parameter(gl, 0x9246, Text("Real GPU Renderer".into()))
            .with_parameter(gl, 0x9245, Text("Real GPU Vendor".into()))
            .with_parameter(gl, 0x0B71, Number(1.0))
            .with("WebGLShaderPrecisionFormat", "precision", Data(Number(23.0)))
            .with("history", "length", Data(Number(12.0)))
            .with("HTMLElement", "offsetWidth", Data(Number(640.0)))
            .with("StorageManager", "estimate", Method(Number(2.0e11)))
            .with("Permissions", "query", Method(Text("granted".into())))
            .with("FontFaceSet", "check", Method(SpoofValue::Bool(true)))
            .with("BaseAudioContext", "sampleRate", Data(Number(96_000.0)))
            .with("AudioContext", "baseLatency", Data(Number(0.0029)))
    }

    pub fn with(mut self, object: &str, member: &str, value: HostMember) -> Self {
        self.objects
            .entry(object.to_string())
            .or_default()
            .insert(member.to_string(), value);
        self
    }

    pub fn with_parameter(mut self, object: &str, pname: u32, value: SpoofValue) -> Self {
        self.parameters.insert((object.to_string(), pname), value);
        self
    }

    /// Make `script_src` the executing script; `None` for inline code.
    pub fn run_as(&mut self, script_src: Option<&str>) {
        self.current_script = script_src.map(str::to_string);
    }

    pub fn is_trapped(&self, object: &str, member: &str) -> bool {
        self.traps
            .contains_key(&(object.to_string(), member.to_string()))
    }

    /// Times the original method actually ran.
    pub fn invocations(&self, object: &str, member: &str) -> u32 {
        self.invocations
            .borrow()
            .get(&(object.to_string(), member.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Origins that received an absent result, in order.
    pub fn denied_origins(&self) -> Vec<ScriptOrigin> {
        self.denied.borrow().clone()
    }

    fn real(&self, object: &str, member: &str) -> Option<&HostMember> {
        self.objects.get(object).and_then(|o| o.get(member))
    }

    fn trap(&self, object: &str, member: &str) -> Option<&InstalledTrap> {
        self.traps.get(&(object.to_string(), member.to_string()))
    }

    fn deny(&self, origin: ScriptOrigin) {
        self.denied.borrow_mut().push(origin);
    }

    /// Property read by the current script.
    pub fn read(&self, object: &str, member: &str) -> Option<SpoofValue> {
        let real = match self.real(object, member)? {
            HostMember::Data(value) | HostMember::Accessor(value) | HostMember::Constant(value) => {
                value.clone()
            }
            HostMember::Method(_) | HostMember::Function => return None,
        };
        let Some(trap) = self.trap(object, member).filter(|t| t.kind == TrapKind::Property) else {
            return Some(real);
        };
        let origin = self.attribute();
        match trap.gate.read(&trap.attribute, &origin) {
            Resolution::Real => Some(real),
            Resolution::Absent => {
                self.deny(origin);
                None
            }
            Resolution::Substitute(value) => Some(value),
        }
    }

    /// Property write by the current script. Returns whether it took effect.
    pub fn write(&mut self, object: &str, member: &str, value: SpoofValue) -> bool {
        if let Some(trap) = self.trap(object, member) {
            let origin = self.attribute();
            if !trap.gate.write(&trap.attribute, &origin) {
                self.deny(origin);
                return false;
            }
        }
        match self.objects.get_mut(object).and_then(|o| o.get_mut(member)) {
            Some(HostMember::Data(slot)) => {
                *slot = value;
                true
            }
            _ => false,
        }
    }

    /// Method call by the current script with one string argument.
    pub fn call(&self, object: &str, member: &str, argument: &str) -> Option<SpoofValue> {
        let real = match self.real(object, member)? {
            HostMember::Method(value) => value.clone(),
            _ => return None,
        };
        let Some(trap) = self.trap(object, member) else {
            return Some(self.invoke(object, member, real));
        };
        let origin = self.attribute();
        match trap.gate.call(&trap.attribute, &origin) {
            Resolution::Real => Some(self.invoke(object, member, real)),
            Resolution::Absent => {
                self.deny(origin);
                None
            }
            Resolution::Substitute(value) => Some(match trap.attribute.as_str() {
                attrs::FONTS_CHECK => {
                    SpoofValue::Bool(font_check_answer(value.as_list().unwrap_or(&[]), argument))
                }
                _ => value,
            }),
        }
    }

    /// `getParameter(pname)` on a WebGL context prototype.
    pub fn get_parameter(&self, object: &str, pname: u32) -> Option<SpoofValue> {
        let real = self.parameters.get(&(object.to_string(), pname)).cloned();
        let trapped = self
            .trap(object, "getParameter")
            .filter(|t| t.kind == TrapKind::Parameter);
        let (Some(trap), Some(attribute)) = (trapped, webgl_parameter_attribute(object, pname))
        else {
            return real.map(|v| self.invoke(object, "getParameter", v));
        };
        let origin = self.attribute();
        match trap.gate.call(&attribute, &origin) {
            Resolution::Real => real.map(|v| self.invoke(object, "getParameter", v)),
            Resolution::Absent => {
                self.deny(origin);
                None
            }
            Resolution::Substitute(value) => Some(value),
        }
    }

    fn invoke(&self, object: &str, member: &str, result: SpoofValue) -> SpoofValue {
        *self
            .invocations
            .borrow_mut()
            .entry((object.to_string(), member.to_string()))
            .or_insert(0) += 1;
        result
    }
}

impl Interceptor for SandboxHost {
    fn list_properties(&self, holder: &Holder) -> Result<Vec<String>> {
        let object = self
            .objects
            .get(holder.name())
            .ok_or_else(|| GuardError::SurfaceUnavailable(holder.name().to_string()))?;
        Ok(object
            .iter()
            .filter(|(_, m)| {
                matches!(
                    m,
                    HostMember::Data(_) | HostMember::Accessor(_) | HostMember::Constant(_)
                )
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn install(&mut self, trap: &Trap, gate: Rc<AccessGate>) -> Result<()> {
        let object = trap.holder.name();
        let member = self
            .real(object, &trap.member)
            .ok_or_else(|| GuardError::SurfaceUnavailable(trap.attribute.to_string()))?;
        if matches!(member, HostMember::Constant(_)) {
            return Err(GuardError::TrapInstallFailed {
                attribute: trap.attribute.to_string(),
                reason: "not configurable".into(),
            });
        }
        let shape_matches = match trap.kind {
            TrapKind::Property => matches!(member, HostMember::Data(_) | HostMember::Accessor(_)),
            TrapKind::Method | TrapKind::AsyncMethod | TrapKind::Parameter => {
                matches!(member, HostMember::Method(_))
            }
        };
        if !shape_matches {
            return Err(GuardError::TrapInstallFailed {
                attribute: trap.attribute.to_string(),
                reason: format!("not a {:?}", trap.kind),
            });
        }
        self.traps.insert(
            (object.to_string(), trap.member.clone()),
            InstalledTrap {
                kind: trap.kind,
                attribute: trap.attribute.clone(),
                gate,
            },
        );
        Ok(())
    }

    fn attribute(&self) -> ScriptOrigin {
        ScriptOrigin::resolve(self.current_script.as_deref(), &self.page_url)
    }

    fn restore(&mut self) -> usize {
        let removed = self.traps.len();
        self.traps.clear();
        removed
    }
}
