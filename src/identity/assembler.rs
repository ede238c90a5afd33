//! Identity assembly
//!
//! Draws every attribute of a persona from one platform record. Disabled
//! attributes fall back to the platform's deterministic default (the first
//! pool entry) instead of a random draw.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::platforms::{platform_record, Platform, PlatformRecord, ScreenProfile};

/// Locale to plausible-timezone mapping, exposed for validation.
static LOCALE_TIMEZONES: &[(&str, &[&str])] = &[
    ("en-US", &["America/New_York", "America/Chicago", "America/Denver", "America/Los_Angeles"]),
    ("en-GB", &["Europe/London"]),
    ("de-DE", &["Europe/Berlin"]),
    ("fr-FR", &["Europe/Paris"]),
    ("es-ES", &["Europe/Madrid"]),
    ("it-IT", &["Europe/Rome"]),
    ("pt-BR", &["America/Sao_Paulo"]),
    ("nl-NL", &["Europe/Amsterdam"]),
    ("pl-PL", &["Europe/Warsaw"]),
    ("tr-TR", &["Europe/Istanbul"]),
    ("ar-SA", &["Asia/Riyadh"]),
    ("ja-JP", &["Asia/Tokyo"]),
    ("ko-KR", &["Asia/Seoul"]),
    ("zh-CN", &["Asia/Shanghai"]),
    ("ru-RU", &["Europe/Moscow"]),
    ("en-AU", &["Australia/Sydney", "Australia/Melbourne"]),
];

/// Timezones plausible for a locale, if the locale is known.
pub fn plausible_timezones(locale: &str) -> Option<&'static [&'static str]> {
    LOCALE_TIMEZONES
        .iter()
        .find(|(l, _)| l.eq_ignore_ascii_case(locale))
        .map(|(_, tzs)| *tzs)
}

/// Which attributes are randomized vs pinned to the platform default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    /// Pin a platform; `None` draws one at random.
    pub platform: Option<Platform>,
    /// Locale driving languages and timezone plausibility.
    pub locale: Option<String>,
    pub randomize_user_agent: bool,
    pub randomize_screen: bool,
    pub randomize_webgl: bool,
    pub randomize_fonts: bool,
    pub randomize_hardware: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            platform: None,
            locale: None,
            randomize_user_agent: true,
            randomize_screen: true,
            randomize_webgl: true,
            randomize_fonts: true,
            randomize_hardware: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenInfo {
    pub width: u32,
    pub height: u32,
    pub avail_width: u32,
    pub avail_height: u32,
    pub device_pixel_ratio: f64,
    pub color_depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebGlInfo {
    pub vendor: String,
    pub renderer: String,
}

/// One synthesized browser persona. Immutable after generation; applied to
/// a browser context exactly once, at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub platform: Platform,
    pub user_agent: String,
    pub viewport: Viewport,
    pub screen: ScreenInfo,
    pub vendor: String,
    pub languages: Vec<String>,
    pub timezone: String,
    pub hardware_concurrency: u32,
    pub device_memory: u32,
    pub plugins: Vec<String>,
    pub fonts: Vec<String>,
    pub webgl: WebGlInfo,
    pub canvas_seed: u64,
    pub webgl_seed: u64,
    pub audio_seed: u64,
    pub tls_profile_id: String,
}

/// Identity source seam. The session pool only sees this trait.
pub trait IdentityGenerator: Send + Sync {
    fn generate(&self, config: &IdentityConfig) -> Identity;
}

/// Table-driven assembler over the built-in platform records.
#[derive(Debug, Default)]
pub struct IdentityAssembler;

impl IdentityAssembler {
    pub fn new() -> Self {
        Self
    }

    fn pick_screen(record: &PlatformRecord, randomize: bool, rng: &mut impl Rng) -> ScreenProfile {
        if randomize {
            *record.screens.choose(rng).expect("non-empty screen pool")
        } else {
            record.screens[0]
        }
    }
}

impl IdentityGenerator for IdentityAssembler {
    fn generate(&self, config: &IdentityConfig) -> Identity {
        let mut rng = rand::thread_rng();

        let platform = config
            .platform
            .unwrap_or_else(|| *Platform::ALL.choose(&mut rng).expect("non-empty"));
        let record = platform_record(platform);

        let user_agent = if config.randomize_user_agent {
            *record.user_agents.choose(&mut rng).expect("non-empty")
        } else {
            record.user_agents[0]
        };

        let screen_profile = Self::pick_screen(record, config.randomize_screen, &mut rng);
        let screen = ScreenInfo {
            width: screen_profile.width,
            height: screen_profile.height,
            avail_width: screen_profile.avail_width,
            avail_height: screen_profile.avail_height,
            device_pixel_ratio: screen_profile.device_pixel_ratio,
            color_depth: screen_profile.color_depth,
        };
        // Browser window chrome eats a slice of the available height.
        let chrome_px = if config.randomize_screen {
            rng.gen_range(72..132)
        } else {
            100
        };
        let viewport = Viewport {
            width: screen.avail_width,
            height: screen.avail_height.saturating_sub(chrome_px).max(400),
        };

        let webgl_profile = if config.randomize_webgl {
            *record.webgl.choose(&mut rng).expect("non-empty")
        } else {
            record.webgl[0]
        };

        let fonts: Vec<String> = if config.randomize_fonts {
            // A random subset keeps the enumeration plausible while staying
            // inside the platform's pool.
            let keep = rng.gen_range(record.fonts.len() * 3 / 4..=record.fonts.len());
            let mut pool: Vec<&str> = record.fonts.to_vec();
            pool.shuffle(&mut rng);
            let mut subset: Vec<String> = pool[..keep].iter().map(|s| s.to_string()).collect();
            subset.sort_unstable();
            subset
        } else {
            record.fonts.iter().map(|s| s.to_string()).collect()
        };

        let (hardware_concurrency, device_memory) = if config.randomize_hardware {
            (
                *record.hardware_concurrency.choose(&mut rng).expect("non-empty"),
                *record.device_memory.choose(&mut rng).expect("non-empty"),
            )
        } else {
            (record.hardware_concurrency[0], record.device_memory[0])
        };

        let (languages, timezone) = match &config.locale {
            Some(locale) => {
                let primary = locale.split('-').next().unwrap_or(locale).to_string();
                let languages = if primary == *locale {
                    vec![locale.clone()]
                } else {
                    vec![locale.clone(), primary]
                };
                let timezone = plausible_timezones(locale)
                    .and_then(|tzs| tzs.choose(&mut rng).copied())
                    .unwrap_or(record.timezone)
                    .to_string();
                (languages, timezone)
            }
            None => (
                record.languages.iter().map(|s| s.to_string()).collect(),
                record.timezone.to_string(),
            ),
        };

        // Distinct seeds feed the deterministic per-session noise generators.
        let canvas_seed: u64 = rng.gen();
        let mut webgl_seed: u64 = rng.gen();
        while webgl_seed == canvas_seed {
            webgl_seed = rng.gen();
        }
        let mut audio_seed: u64 = rng.gen();
        while audio_seed == canvas_seed || audio_seed == webgl_seed {
            audio_seed = rng.gen();
        }

        let tls_profile_id = record
            .tls_profiles
            .choose(&mut rng)
            .expect("non-empty")
            .to_string();

        debug!(%platform, user_agent, "identity assembled");

        Identity {
            platform,
            user_agent: user_agent.to_string(),
            viewport,
            screen,
            vendor: record.vendor.to_string(),
            languages,
            timezone,
            hardware_concurrency,
            device_memory,
            plugins: record.plugins.iter().map(|s| s.to_string()).collect(),
            fonts,
            webgl: WebGlInfo {
                vendor: webgl_profile.vendor.to_string(),
                renderer: webgl_profile.renderer.to_string(),
            },
            canvas_seed,
            webgl_seed,
            audio_seed,
            tls_profile_id,
        }
    }
}

/// Check every correlation invariant of an identity against its platform
/// record. Returns the list of violations; empty means consistent.
pub fn validate_identity(identity: &Identity) -> Result<(), Vec<String>> {
    let record = platform_record(identity.platform);
    let mut violations = Vec::new();

    if !record.user_agents.contains(&identity.user_agent.as_str()) {
        violations.push(format!("user agent not in platform pool: {}", identity.user_agent));
    }
    if !record
        .webgl
        .iter()
        .any(|w| w.vendor == identity.webgl.vendor && w.renderer == identity.webgl.renderer)
    {
        violations.push(format!("webgl pair not in platform pool: {}", identity.webgl.renderer));
    }
    for font in &identity.fonts {
        if !record.fonts.contains(&font.as_str()) {
            violations.push(format!("font not in platform pool: {font}"));
        }
    }
    if !record.hardware_concurrency.contains(&identity.hardware_concurrency) {
        violations.push(format!("hardwareConcurrency not in pool: {}", identity.hardware_concurrency));
    }
    if !record.device_memory.contains(&identity.device_memory) {
        violations.push(format!("deviceMemory not in pool: {}", identity.device_memory));
    }
    if !record.tls_profiles.contains(&identity.tls_profile_id.as_str()) {
        violations.push(format!("TLS profile not in pool: {}", identity.tls_profile_id));
    }

    if identity.viewport.width > identity.screen.avail_width
        || identity.viewport.height > identity.screen.avail_height
    {
        violations.push("viewport exceeds available screen size".into());
    }
    if identity.screen.avail_width > identity.screen.width
        || identity.screen.avail_height > identity.screen.height
    {
        violations.push("available screen size exceeds screen size".into());
    }
    if !(0.5..=3.0).contains(&identity.screen.device_pixel_ratio) {
        violations.push(format!("devicePixelRatio out of range: {}", identity.screen.device_pixel_ratio));
    }
    if !matches!(identity.screen.color_depth, 24 | 30 | 32) {
        violations.push(format!("colorDepth out of range: {}", identity.screen.color_depth));
    }

    if let Some(locale) = identity.languages.first() {
        if let Some(tzs) = plausible_timezones(locale) {
            if !tzs.contains(&identity.timezone.as_str()) && identity.timezone != record.timezone {
                violations.push(format!(
                    "timezone {} implausible for locale {locale}",
                    identity.timezone
                ));
            }
        }
    }

    if identity.canvas_seed == identity.webgl_seed
        || identity.canvas_seed == identity.audio_seed
        || identity.webgl_seed == identity.audio_seed
    {
        violations.push("noise seeds are not distinct".into());
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hundred_identities_stay_correlated() {
        let assembler = IdentityAssembler::new();
        let config = IdentityConfig::default();

        for _ in 0..100 {
            let identity = assembler.generate(&config);
            let record = platform_record(identity.platform);

            assert!(identity.user_agent.contains(identity.platform.ua_token()));
            assert!(record
                .webgl
                .iter()
                .any(|w| w.renderer == identity.webgl.renderer));
            for font in &identity.fonts {
                assert!(record.fonts.contains(&font.as_str()), "foreign font {font}");
            }
            validate_identity(&identity).expect("identity must validate");
        }
    }

    #[test]
    fn disabled_flags_use_deterministic_defaults() {
        let assembler = IdentityAssembler::new();
        let config = IdentityConfig {
            platform: Some(Platform::Windows),
            randomize_user_agent: false,
            randomize_screen: false,
            randomize_webgl: false,
            randomize_fonts: false,
            randomize_hardware: false,
            ..Default::default()
        };

        let a = assembler.generate(&config);
        let b = assembler.generate(&config);
        assert_eq!(a.user_agent, b.user_agent);
        assert_eq!(a.screen, b.screen);
        assert_eq!(a.webgl, b.webgl);
        assert_eq!(a.fonts, b.fonts);
        assert_eq!(a.hardware_concurrency, b.hardware_concurrency);
        let record = platform_record(Platform::Windows);
        assert_eq!(a.user_agent, record.user_agents[0]);
    }

    #[test]
    fn locale_drives_languages_and_timezone() {
        let assembler = IdentityAssembler::new();
        let config = IdentityConfig {
            platform: Some(Platform::Linux),
            locale: Some("de-DE".into()),
            ..Default::default()
        };

        let identity = assembler.generate(&config);
        assert_eq!(identity.languages, vec!["de-DE".to_string(), "de".to_string()]);
        assert_eq!(identity.timezone, "Europe/Berlin");
        validate_identity(&identity).unwrap();
    }

    #[test]
    fn unknown_locale_falls_back_to_platform_timezone() {
        let assembler = IdentityAssembler::new();
        let config = IdentityConfig {
            platform: Some(Platform::MacOs),
            locale: Some("xx-XX".into()),
            ..Default::default()
        };
        let identity = assembler.generate(&config);
        assert_eq!(identity.timezone, platform_record(Platform::MacOs).timezone);
    }

    #[test]
    fn seeds_are_distinct() {
        let assembler = IdentityAssembler::new();
        let identity = assembler.generate(&IdentityConfig::default());
        assert_ne!(identity.canvas_seed, identity.webgl_seed);
        assert_ne!(identity.canvas_seed, identity.audio_seed);
        assert_ne!(identity.webgl_seed, identity.audio_seed);
    }
}
