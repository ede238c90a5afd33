//! Browser driver seam
//!
//! The core controls an abstract browser context: navigate, evaluate,
//! install init scripts, close. Identity binding happens here, once at
//! context creation, by setting viewport/locale/timezone, installing the
//! stealth init script, and sending identity-consistent headers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::identity::Identity;
use crate::proxy::DriverProxy;

use super::errors::BrowserError;

/// Everything the driver needs to open one context.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub identity: Identity,
    pub proxy: Option<DriverProxy>,
    pub persist_cookies: bool,
    pub headless: bool,
    pub timeout: Duration,
}

/// A cookie observed on a loaded page.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
}

/// What a navigation returns: enough of the loaded page for the detection
/// classifiers and extractors to work on.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub url: String,
    pub status: Option<u16>,
    pub html: String,
    pub cookies: Vec<Cookie>,
}

/// One live browser context. Implementations wrap a real driver; tests use
/// a scripted mock.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<PageSnapshot, BrowserError>;

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError>;

    /// Install a script that runs before any page script on every
    /// subsequent navigation.
    async fn set_init_script(&self, script: &str) -> Result<(), BrowserError>;

    async fn set_extra_headers(&self, headers: HashMap<String, String>)
        -> Result<(), BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

/// Opens browser contexts. The one seam a real driver integration has to
/// implement.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn BrowserContext>, BrowserError>;
}

/// HTTP headers consistent with an identity.
pub fn identity_headers(identity: &Identity) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("User-Agent".to_string(), identity.user_agent.clone());
    let accept_language = match identity.languages.as_slice() {
        [] => "en-US,en;q=0.9".to_string(),
        [only] => format!("{only};q=0.9"),
        [first, rest @ ..] => {
            let mut value = first.clone();
            for (i, lang) in rest.iter().enumerate() {
                value.push_str(&format!(",{lang};q=0.{}", 9 - i.min(8)));
            }
            value
        }
    };
    headers.insert("Accept-Language".to_string(), accept_language);
    headers.insert(
        "Accept".to_string(),
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
            .to_string(),
    );
    headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());
    headers
}

/// Build the init script that overrides the fingerprint surface to match
/// the identity: navigator properties, screen geometry, WebGL strings,
/// canvas/audio noise seeded from the identity, WebRTC, and battery.
pub fn stealth_init_script(identity: &Identity) -> String {
    let languages = serde_json::to_string(&identity.languages).unwrap_or_else(|_| "[]".into());
    let plugins = serde_json::to_string(&identity.plugins).unwrap_or_else(|_| "[]".into());
    let fonts = serde_json::to_string(&identity.fonts).unwrap_or_else(|_| "[]".into());

    format!(
        r#"(() => {{
  const define = (obj, prop, value) =>
    Object.defineProperty(obj, prop, {{ get: () => value, configurable: true }});

  define(navigator, 'webdriver', undefined);
  define(navigator, 'platform', '{nav_platform}');
  define(navigator, 'vendor', '{vendor}');
  define(navigator, 'languages', Object.freeze({languages}));
  define(navigator, 'hardwareConcurrency', {hw_concurrency});
  define(navigator, 'deviceMemory', {device_memory});

  const pluginNames = {plugins};
  define(navigator, 'plugins', pluginNames.map(name => ({{ name }})));

  define(screen, 'width', {screen_w});
  define(screen, 'height', {screen_h});
  define(screen, 'availWidth', {avail_w});
  define(screen, 'availHeight', {avail_h});
  define(screen, 'colorDepth', {color_depth});
  define(screen, 'pixelDepth', {color_depth});
  define(window, 'devicePixelRatio', {dpr});

  const webglVendor = '{webgl_vendor}';
  const webglRenderer = '{webgl_renderer}';
  for (const proto of [WebGLRenderingContext.prototype,
                       typeof WebGL2RenderingContext !== 'undefined' ? WebGL2RenderingContext.prototype : null]) {{
    if (!proto) continue;
    const getParameter = proto.getParameter;
    proto.getParameter = function (param) {{
      if (param === 0x9245) return webglVendor;
      if (param === 0x9246) return webglRenderer;
      return getParameter.call(this, param);
    }};
  }}

  // Deterministic per-session noise: a tiny seeded PRNG perturbs canvas
  // reads and audio samples so repeat reads within the session agree.
  const mulberry32 = seed => () => {{
    seed |= 0; seed = seed + 0x6D2B79F5 | 0;
    let t = Math.imul(seed ^ seed >>> 15, 1 | seed);
    t = t + Math.imul(t ^ t >>> 7, 61 | t) ^ t;
    return ((t ^ t >>> 14) >>> 0) / 4294967296;
  }};
  const canvasNoise = mulberry32({canvas_seed});
  const toDataURL = HTMLCanvasElement.prototype.toDataURL;
  HTMLCanvasElement.prototype.toDataURL = function (...args) {{
    const ctx = this.getContext('2d');
    if (ctx && this.width > 0 && this.height > 0) {{
      const image = ctx.getImageData(0, 0, 1, 1);
      image.data[0] = image.data[0] ^ (canvasNoise() * 4 | 0);
      ctx.putImageData(image, 0, 0);
    }}
    return toDataURL.apply(this, args);
  }};

  const audioNoise = mulberry32({audio_seed});
  if (typeof AudioBuffer !== 'undefined') {{
    const getChannelData = AudioBuffer.prototype.getChannelData;
    AudioBuffer.prototype.getChannelData = function (...args) {{
      const data = getChannelData.apply(this, args);
      if (data.length > 0) data[0] += audioNoise() * 1e-7;
      return data;
    }};
  }}

  if (navigator.getBattery) {{
    navigator.getBattery = () => Promise.resolve({{
      charging: true, chargingTime: 0, dischargingTime: Infinity, level: 1.0,
      addEventListener: () => {{}}, removeEventListener: () => {{}},
    }});
  }}

  // Blind WebRTC local-address enumeration.
  if (typeof RTCPeerConnection !== 'undefined') {{
    const OrigRTC = RTCPeerConnection;
    window.RTCPeerConnection = function (...args) {{
      if (args[0] && args[0].iceServers) args[0].iceServers = [];
      return new OrigRTC(...args);
    }};
    window.RTCPeerConnection.prototype = OrigRTC.prototype;
  }}

  document.fonts && define(document, '__installedFonts', Object.freeze({fonts}));

  try {{
    Intl.DateTimeFormat = new Proxy(Intl.DateTimeFormat, {{
      construct(target, args) {{
        if (!args[1]) args[1] = {{}};
        if (!args[1].timeZone) args[1].timeZone = '{timezone}';
        return Reflect.construct(target, args);
      }}
    }});
  }} catch (e) {{}}
}})();"#,
        nav_platform = identity.platform.navigator_platform(),
        vendor = identity.vendor,
        languages = languages,
        hw_concurrency = identity.hardware_concurrency,
        device_memory = identity.device_memory,
        plugins = plugins,
        screen_w = identity.screen.width,
        screen_h = identity.screen.height,
        avail_w = identity.screen.avail_width,
        avail_h = identity.screen.avail_height,
        color_depth = identity.screen.color_depth,
        dpr = identity.screen.device_pixel_ratio,
        webgl_vendor = identity.webgl.vendor,
        webgl_renderer = identity.webgl.renderer,
        canvas_seed = identity.canvas_seed as u32,
        audio_seed = identity.audio_seed as u32,
        fonts = fonts,
        timezone = identity.timezone,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityAssembler, IdentityConfig, IdentityGenerator, Platform};

    fn identity() -> Identity {
        IdentityAssembler::new().generate(&IdentityConfig {
            platform: Some(Platform::Windows),
            ..Default::default()
        })
    }

    #[test]
    fn init_script_embeds_identity_surface() {
        let id = identity();
        let script = stealth_init_script(&id);
        assert!(script.contains(id.platform.navigator_platform()));
        assert!(script.contains(&id.webgl.renderer));
        assert!(script.contains(&id.timezone));
        assert!(script.contains(&format!("'hardwareConcurrency', {}", id.hardware_concurrency)));
    }

    #[test]
    fn headers_match_identity() {
        let id = identity();
        let headers = identity_headers(&id);
        assert_eq!(headers.get("User-Agent"), Some(&id.user_agent));
        assert!(headers
            .get("Accept-Language")
            .is_some_and(|v| v.starts_with(&id.languages[0])));
    }
}
