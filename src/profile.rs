//! Randomized substitute profile.
//!
//! A [`RandomProfile`] maps attribute ids to plausible substitute values.
//! The network-identity subset (user agent, platform, DNT, language) is
//! handed in by the privileged context so that script-visible identity and
//! HTTP request headers agree; everything else is drawn fresh per page.
//!
//! Derived values are kept consistent with the identity: `navigator.vendor`
//! and `navigator.appVersion` follow the user agent, and the WebGL renderer
//! is drawn from adapters that exist on the identity's platform.

use std::collections::BTreeMap;

use base64::Engine as _;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::attribute::AttributeId;

/// Well-known attribute ids used by the generator and the trap layer.
pub mod attrs {
    pub const USER_AGENT: &str = "navigator.userAgent";
    pub const PLATFORM: &str = "navigator.platform";
    pub const LANGUAGE: &str = "navigator.language";
    pub const LANGUAGES: &str = "navigator.languages";
    pub const DO_NOT_TRACK: &str = "navigator.doNotTrack";
    pub const VENDOR: &str = "navigator.vendor";
    pub const APP_VERSION: &str = "navigator.appVersion";
    pub const HARDWARE_CONCURRENCY: &str = "navigator.hardwareConcurrency";
    pub const DEVICE_MEMORY: &str = "navigator.deviceMemory";
    pub const MAX_TOUCH_POINTS: &str = "navigator.maxTouchPoints";
    pub const PLUGINS: &str = "navigator.plugins";

    pub const SCREEN_WIDTH: &str = "screen.width";
    pub const SCREEN_HEIGHT: &str = "screen.height";
    pub const SCREEN_AVAIL_WIDTH: &str = "screen.availWidth";
    pub const SCREEN_AVAIL_HEIGHT: &str = "screen.availHeight";
    pub const SCREEN_COLOR_DEPTH: &str = "screen.colorDepth";
    pub const SCREEN_PIXEL_DEPTH: &str = "screen.pixelDepth";

    pub const CANVAS_TO_DATA_URL: &str = "HTMLCanvasElement.toDataURL";

    pub const WEBGL_VENDOR: &str = "WebGLRenderingContext.VENDOR";
    pub const WEBGL_RENDERER: &str = "WebGLRenderingContext.RENDERER";
    pub const WEBGL_UNMASKED_VENDOR: &str = "WebGLRenderingContext.UNMASKED_VENDOR_WEBGL";
    pub const WEBGL_UNMASKED_RENDERER: &str = "WebGLRenderingContext.UNMASKED_RENDERER_WEBGL";
    pub const WEBGL2_VENDOR: &str = "WebGL2RenderingContext.VENDOR";
    pub const WEBGL2_RENDERER: &str = "WebGL2RenderingContext.RENDERER";
    pub const WEBGL2_UNMASKED_VENDOR: &str = "WebGL2RenderingContext.UNMASKED_VENDOR_WEBGL";
    pub const WEBGL2_UNMASKED_RENDERER: &str = "WebGL2RenderingContext.UNMASKED_RENDERER_WEBGL";
    pub const SHADER_PRECISION: &str = "WebGLShaderPrecisionFormat.precision";
    pub const SHADER_RANGE_MIN: &str = "WebGLShaderPrecisionFormat.rangeMin";
    pub const SHADER_RANGE_MAX: &str = "WebGLShaderPrecisionFormat.rangeMax";

    pub const HISTORY_LENGTH: &str = "history.length";
    pub const STORAGE_ESTIMATE: &str = "StorageManager.estimate";
    pub const PERMISSIONS_QUERY: &str = "Permissions.query";
    pub const PERMISSION_STATE: &str = "PermissionStatus.state";
    pub const FONTS_CHECK: &str = "FontFaceSet.check";

    pub const AUDIO_SAMPLE_RATE: &str = "BaseAudioContext.sampleRate";
    pub const AUDIO_BASE_LATENCY: &str = "AudioContext.baseLatency";
    pub const AUDIO_OUTPUT_LATENCY: &str = "AudioContext.outputLatency";
    pub const AUDIO_MAX_CHANNELS: &str = "AudioDestinationNode.maxChannelCount";
    pub const AUDIO_CHANNEL_COUNT: &str = "AudioNode.channelCount";
}

/// A substitute value. Shapes mirror the JS types of the real attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpoofValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl SpoofValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SpoofValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SpoofValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            SpoofValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// The JS `typeof` the value will have once converted.
    pub fn js_type(&self) -> &'static str {
        match self {
            SpoofValue::Null | SpoofValue::List(_) => "object",
            SpoofValue::Bool(_) => "boolean",
            SpoofValue::Number(_) => "number",
            SpoofValue::Text(_) => "string",
        }
    }
}

/// The subset of identity that must agree with outgoing HTTP headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkIdentity {
    pub user_agent: String,
    pub platform: String,
    #[serde(default)]
    pub do_not_track: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Browser identities the privileged context chooses from.
const BROWSER_IDENTITIES: &[(&str, &str)] = &[
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Win32",
    ),
    (
        "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Linux x86_64",
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "MacIntel",
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
        "Win32",
    ),
];

/// Locales offered for `navigator.language` and `Accept-Language`.
pub const LOCALES: &[&str] = &["en-US", "fr-FR", "es-ES", "de-DE", "zh-CN"];

impl NetworkIdentity {
    /// Pick a coherent identity: UA and platform come from the same entry.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let (user_agent, platform) = BROWSER_IDENTITIES
            .choose(rng)
            .copied()
            .unwrap_or(BROWSER_IDENTITIES[0]);
        let language = LOCALES.choose(rng).copied().unwrap_or("en-US");
        Self {
            user_agent: user_agent.to_string(),
            platform: platform.to_string(),
            do_not_track: Some(if rng.gen_bool(0.5) { "1" } else { "0" }.to_string()),
            language: Some(language.to_string()),
        }
    }

    /// `navigator.vendor` as the browser named by the user agent reports it.
    pub fn vendor(&self) -> &'static str {
        let ua = self.user_agent.as_str();
        if ua.contains("Firefox/") {
            ""
        } else if ua.contains("Chrome/") {
            "Google Inc."
        } else if ua.contains("Safari/") {
            "Apple Computer, Inc."
        } else {
            ""
        }
    }

    /// `navigator.appVersion`: the user agent without its `Mozilla/` prefix.
    pub fn app_version(&self) -> String {
        self.user_agent
            .strip_prefix("Mozilla/")
            .unwrap_or(&self.user_agent)
            .to_string()
    }
}

/// Mapping of attribute id to substitute value for one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RandomProfile {
    values: BTreeMap<AttributeId, SpoofValue>,
}

impl RandomProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, attribute: &AttributeId) -> Option<&SpoofValue> {
        self.values.get(attribute)
    }

    pub fn get_str(&self, attribute: &str) -> Option<&SpoofValue> {
        self.values.get(&AttributeId::from(attribute))
    }

    pub fn insert(&mut self, attribute: &str, value: SpoofValue) {
        self.values.insert(AttributeId::from(attribute), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttributeId, &SpoofValue)> {
        self.values.iter()
    }
}

/// Screen resolutions drawn for `screen.width`/`screen.height`.
pub const SCREEN_RESOLUTIONS: &[(u32, u32)] = &[
    (1024, 768),
    (1280, 720),
    (1280, 800),
    (1366, 768),
    (1440, 900),
    (1536, 864),
    (1600, 900),
    (1680, 1050),
    (1920, 1080),
    (1920, 1200),
];

/// Inclusive width range every generated `screen.width` lies in.
pub const SCREEN_WIDTH_RANGE: (u32, u32) = (1024, 1920);

/// (platform, unmasked vendor, unmasked renderer)
pub const WEBGL_ADAPTERS: &[(&str, &str, &str)] = &[
    (
        "Win32",
        "Google Inc. (NVIDIA)",
        "ANGLE (NVIDIA, NVIDIA GeForce GTX 1650 Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
    (
        "Win32",
        "Google Inc. (Intel)",
        "ANGLE (Intel, Intel(R) UHD Graphics 620 Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
    (
        "Win32",
        "Google Inc. (AMD)",
        "ANGLE (AMD, AMD Radeon RX 580 Series Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
    ("MacIntel", "Apple Inc.", "Apple M1"),
    ("MacIntel", "Intel Inc.", "Intel(R) Iris(TM) Plus Graphics 655"),
    ("Linux x86_64", "Intel", "Mesa Intel(R) UHD Graphics 620 (KBL GT2)"),
    ("Linux x86_64", "AMD", "AMD Radeon RX 580 Series (polaris10, LLVM 15.0.7, DRM 3.49)"),
];

/// Reference font list; profiles expose a random non-empty subset.
pub const REFERENCE_FONTS: &[&str] = &[
    "Arial",
    "Courier New",
    "Georgia",
    "Helvetica",
    "Times New Roman",
    "Trebuchet MS",
    "Verdana",
    "Tahoma",
    "Palatino",
    "Garamond",
    "Comic Sans MS",
    "Impact",
    "Lucida Console",
    "DejaVu Sans",
    "Liberation Serif",
];

/// Reference plugin list; profiles expose a random prefix.
pub const REFERENCE_PLUGINS: &[&str] = &[
    "PDF Viewer",
    "Chrome PDF Viewer",
    "Chromium PDF Viewer",
    "Microsoft Edge PDF Viewer",
    "WebKit built-in PDF",
];

pub const AUDIO_SAMPLE_RATES: &[f64] = &[44_100.0, 48_000.0];
pub const AUDIO_BASE_LATENCY_RANGE: (f64, f64) = (0.005, 0.03);
pub const AUDIO_OUTPUT_LATENCY_RANGE: (f64, f64) = (0.01, 0.05);
pub const AUDIO_MAX_CHANNEL_COUNTS: &[f64] = &[2.0, 6.0, 8.0];

const HARDWARE_CONCURRENCY: &[f64] = &[2.0, 4.0, 6.0, 8.0, 12.0, 16.0];
const DEVICE_MEMORY: &[f64] = &[2.0, 4.0, 8.0];
const COLOR_DEPTHS: &[f64] = &[24.0, 30.0];
const STORAGE_QUOTAS_GIB: &[f64] = &[10.0, 32.0, 64.0, 120.0, 250.0];

/// A transparent 1×1 PNG, exported in place of real canvas contents.
const DECOY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// Data URL returned by a spoofed `toDataURL`.
pub fn decoy_data_url() -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(DECOY_PNG)
    )
}

/// Builds [`RandomProfile`]s.
#[derive(Debug, Clone, Default)]
pub struct ProfileGenerator;

impl ProfileGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generate with the thread-local RNG (`crypto.getRandomValues` in WASM).
    pub fn generate(&self, identity: &NetworkIdentity) -> RandomProfile {
        self.generate_with(identity, &mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(
        &self,
        identity: &NetworkIdentity,
        rng: &mut R,
    ) -> RandomProfile {
        let mut profile = RandomProfile::new();

        self.fill_navigator(&mut profile, identity, rng);
        self.fill_screen(&mut profile, rng);
        self.fill_webgl(&mut profile, &identity.platform, rng);
        self.fill_audio(&mut profile, rng);
        self.fill_misc(&mut profile, rng);

        log::debug!(
            "Generated random profile with {} substitutes for platform {}",
            profile.len(),
            identity.platform
        );
        profile
    }

    fn fill_navigator<R: Rng + ?Sized>(
        &self,
        profile: &mut RandomProfile,
        identity: &NetworkIdentity,
        rng: &mut R,
    ) {
        profile.insert(attrs::USER_AGENT, SpoofValue::Text(identity.user_agent.clone()));
        profile.insert(attrs::PLATFORM, SpoofValue::Text(identity.platform.clone()));
        profile.insert(attrs::VENDOR, SpoofValue::Text(identity.vendor().to_string()));
        profile.insert(attrs::APP_VERSION, SpoofValue::Text(identity.app_version()));

        let language = identity
            .language
            .clone()
            .unwrap_or_else(|| LOCALES.choose(rng).copied().unwrap_or("en-US").to_string());
        let mut languages = vec![language.clone()];
        if let Some((base, _)) = language.split_once('-') {
            languages.push(base.to_string());
        }
        profile.insert(attrs::LANGUAGE, SpoofValue::Text(language));
        profile.insert(attrs::LANGUAGES, SpoofValue::List(languages));

        let dnt = match &identity.do_not_track {
            Some(value) => SpoofValue::Text(value.clone()),
            None => SpoofValue::Null,
        };
        profile.insert(attrs::DO_NOT_TRACK, dnt);

        profile.insert(
            attrs::HARDWARE_CONCURRENCY,
            SpoofValue::Number(*HARDWARE_CONCURRENCY.choose(rng).unwrap_or(&4.0)),
        );
        profile.insert(
            attrs::DEVICE_MEMORY,
            SpoofValue::Number(*DEVICE_MEMORY.choose(rng).unwrap_or(&8.0)),
        );
        profile.insert(attrs::MAX_TOUCH_POINTS, SpoofValue::Number(0.0));

        let plugin_count = rng.gen_range(0..=REFERENCE_PLUGINS.len());
        profile.insert(
            attrs::PLUGINS,
            SpoofValue::List(
                REFERENCE_PLUGINS[..plugin_count]
                    .iter()
                    .map(|p| p.to_string())
                    .collect(),
            ),
        );
    }

    fn fill_screen<R: Rng + ?Sized>(&self, profile: &mut RandomProfile, rng: &mut R) {
        let (width, height) = SCREEN_RESOLUTIONS
            .choose(rng)
            .copied()
            .unwrap_or((1920, 1080));
        let depth = *COLOR_DEPTHS.choose(rng).unwrap_or(&24.0);

        profile.insert(attrs::SCREEN_WIDTH, SpoofValue::Number(width as f64));
        profile.insert(attrs::SCREEN_HEIGHT, SpoofValue::Number(height as f64));
        profile.insert(attrs::SCREEN_AVAIL_WIDTH, SpoofValue::Number(width as f64));
        // taskbar
        profile.insert(
            attrs::SCREEN_AVAIL_HEIGHT,
            SpoofValue::Number(height as f64 - 40.0),
        );
        profile.insert(attrs::SCREEN_COLOR_DEPTH, SpoofValue::Number(depth));
        profile.insert(attrs::SCREEN_PIXEL_DEPTH, SpoofValue::Number(depth));
    }

    fn fill_webgl<R: Rng + ?Sized>(&self, profile: &mut RandomProfile, platform: &str, rng: &mut R) {
        let matching: Vec<&(&str, &str, &str)> = WEBGL_ADAPTERS
            .iter()
            .filter(|(p, _, _)| *p == platform)
            .collect();
        let (_, vendor, renderer) = if matching.is_empty() {
            *WEBGL_ADAPTERS.choose(rng).unwrap_or(&WEBGL_ADAPTERS[0])
        } else {
            **matching.choose(rng).unwrap_or(&matching[0])
        };

        for (vendor_key, renderer_key) in [
            (attrs::WEBGL_UNMASKED_VENDOR, attrs::WEBGL_UNMASKED_RENDERER),
            (attrs::WEBGL2_UNMASKED_VENDOR, attrs::WEBGL2_UNMASKED_RENDERER),
        ] {
            profile.insert(vendor_key, SpoofValue::Text(vendor.to_string()));
            profile.insert(renderer_key, SpoofValue::Text(renderer.to_string()));
        }
        for (vendor_key, renderer_key) in [
            (attrs::WEBGL_VENDOR, attrs::WEBGL_RENDERER),
            (attrs::WEBGL2_VENDOR, attrs::WEBGL2_RENDERER),
        ] {
            profile.insert(vendor_key, SpoofValue::Text("WebKit".to_string()));
            profile.insert(renderer_key, SpoofValue::Text("WebKit WebGL".to_string()));
        }

        profile.insert(attrs::SHADER_PRECISION, SpoofValue::Number(23.0));
        profile.insert(attrs::SHADER_RANGE_MIN, SpoofValue::Number(127.0));
        profile.insert(attrs::SHADER_RANGE_MAX, SpoofValue::Number(127.0));
        profile.insert(attrs::CANVAS_TO_DATA_URL, SpoofValue::Text(decoy_data_url()));
    }

    fn fill_audio<R: Rng + ?Sized>(&self, profile: &mut RandomProfile, rng: &mut R) {
        profile.insert(
            attrs::AUDIO_SAMPLE_RATE,
            SpoofValue::Number(*AUDIO_SAMPLE_RATES.choose(rng).unwrap_or(&44_100.0)),
        );
        let (lo, hi) = AUDIO_BASE_LATENCY_RANGE;
        profile.insert(attrs::AUDIO_BASE_LATENCY, SpoofValue::Number(rng.gen_range(lo..=hi)));
        let (lo, hi) = AUDIO_OUTPUT_LATENCY_RANGE;
        profile.insert(
            attrs::AUDIO_OUTPUT_LATENCY,
            SpoofValue::Number(rng.gen_range(lo..=hi)),
        );
        profile.insert(
            attrs::AUDIO_MAX_CHANNELS,
            SpoofValue::Number(*AUDIO_MAX_CHANNEL_COUNTS.choose(rng).unwrap_or(&2.0)),
        );
        profile.insert(attrs::AUDIO_CHANNEL_COUNT, SpoofValue::Number(2.0));
    }

    fn fill_misc<R: Rng + ?Sized>(&self, profile: &mut RandomProfile, rng: &mut R) {
        let font_count = rng.gen_range(1..=REFERENCE_FONTS.len());
        let mut fonts: Vec<String> = REFERENCE_FONTS
            .choose_multiple(rng, font_count)
            .map(|f| f.to_string())
            .collect();
        fonts.sort();
        profile.insert(attrs::FONTS_CHECK, SpoofValue::List(fonts));

        profile.insert(
            attrs::HISTORY_LENGTH,
            SpoofValue::Number(rng.gen_range(1..=8) as f64),
        );

        let quota_gib = *STORAGE_QUOTAS_GIB.choose(rng).unwrap_or(&10.0);
        profile.insert(
            attrs::STORAGE_ESTIMATE,
            SpoofValue::Number(quota_gib * 1024.0 * 1024.0 * 1024.0),
        );
        profile.insert(attrs::PERMISSIONS_QUERY, SpoofValue::Text("prompt".to_string()));
        profile.insert(attrs::PERMISSION_STATE, SpoofValue::Text("prompt".to_string()));
    }
}
