//! Per-platform attribute pools
//!
//! One record per supported platform. Every pool on a record is correlated:
//! an identity sampling from a record must sample all attributes from that
//! same record.

use serde::{Deserialize, Serialize};

/// Supported desktop platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Windows, Platform::MacOs, Platform::Linux];

    /// Token every user agent of this platform contains.
    pub fn ua_token(&self) -> &'static str {
        match self {
            Platform::Windows => "Windows NT",
            Platform::MacOs => "Mac OS X",
            Platform::Linux => "Linux x86_64",
        }
    }

    /// `navigator.platform` value.
    pub fn navigator_platform(&self) -> &'static str {
        match self {
            Platform::Windows => "Win32",
            Platform::MacOs => "MacIntel",
            Platform::Linux => "Linux x86_64",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
        };
        f.write_str(s)
    }
}

/// A physical screen profile. Available size is the full size minus window
/// chrome reserved by the OS.
#[derive(Debug, Clone, Copy)]
pub struct ScreenProfile {
    pub width: u32,
    pub height: u32,
    pub avail_width: u32,
    pub avail_height: u32,
    pub device_pixel_ratio: f64,
    pub color_depth: u32,
}

/// A WebGL vendor/renderer pair.
#[derive(Debug, Clone, Copy)]
pub struct WebGlProfile {
    pub vendor: &'static str,
    pub renderer: &'static str,
}

/// Correlated attribute pools for one platform.
pub struct PlatformRecord {
    pub platform: Platform,
    pub user_agents: &'static [&'static str],
    pub vendor: &'static str,
    pub webgl: &'static [WebGlProfile],
    pub fonts: &'static [&'static str],
    pub plugins: &'static [&'static str],
    pub screens: &'static [ScreenProfile],
    pub hardware_concurrency: &'static [u32],
    pub device_memory: &'static [u32],
    pub tls_profiles: &'static [&'static str],
    pub languages: &'static [&'static str],
    pub timezone: &'static str,
}

pub fn platform_record(platform: Platform) -> &'static PlatformRecord {
    match platform {
        Platform::Windows => &WINDOWS,
        Platform::MacOs => &MACOS,
        Platform::Linux => &LINUX,
    }
}

static WINDOWS: PlatformRecord = PlatformRecord {
    platform: Platform::Windows,
    user_agents: &[
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    ],
    vendor: "Google Inc.",
    webgl: &[
        WebGlProfile {
            vendor: "Google Inc. (NVIDIA)",
            renderer: "ANGLE (NVIDIA, NVIDIA GeForce GTX 1660 Direct3D11 vs_5_0 ps_5_0, D3D11)",
        },
        WebGlProfile {
            vendor: "Google Inc. (Intel)",
            renderer: "ANGLE (Intel, Intel(R) UHD Graphics 630 Direct3D11 vs_5_0 ps_5_0, D3D11)",
        },
        WebGlProfile {
            vendor: "Google Inc. (AMD)",
            renderer: "ANGLE (AMD, AMD Radeon RX 580 Direct3D11 vs_5_0 ps_5_0, D3D11)",
        },
    ],
    fonts: &[
        "Arial", "Arial Black", "Calibri", "Cambria", "Candara", "Comic Sans MS", "Consolas",
        "Constantia", "Courier New", "Georgia", "Impact", "Lucida Console", "Segoe UI",
        "Tahoma", "Times New Roman", "Trebuchet MS", "Verdana",
    ],
    plugins: &["PDF Viewer", "Chrome PDF Viewer", "Chromium PDF Viewer", "Microsoft Edge PDF Viewer", "WebKit built-in PDF"],
    screens: &[
        ScreenProfile { width: 1920, height: 1080, avail_width: 1920, avail_height: 1040, device_pixel_ratio: 1.0, color_depth: 24 },
        ScreenProfile { width: 2560, height: 1440, avail_width: 2560, avail_height: 1400, device_pixel_ratio: 1.0, color_depth: 24 },
        ScreenProfile { width: 1366, height: 768, avail_width: 1366, avail_height: 728, device_pixel_ratio: 1.0, color_depth: 24 },
    ],
    hardware_concurrency: &[4, 8, 12, 16],
    device_memory: &[8, 16, 32],
    tls_profiles: &["chrome-131-win", "chrome-130-win"],
    languages: &["en-US", "en"],
    timezone: "America/New_York",
};

static MACOS: PlatformRecord = PlatformRecord {
    platform: Platform::MacOs,
    user_agents: &[
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    ],
    vendor: "Google Inc.",
    webgl: &[
        WebGlProfile {
            vendor: "Google Inc. (Apple)",
            renderer: "ANGLE (Apple, ANGLE Metal Renderer: Apple M2, Unspecified Version)",
        },
        WebGlProfile {
            vendor: "Google Inc. (Apple)",
            renderer: "ANGLE (Apple, ANGLE Metal Renderer: Apple M1 Pro, Unspecified Version)",
        },
    ],
    fonts: &[
        "American Typewriter", "Arial", "Avenir", "Avenir Next", "Courier New", "Futura",
        "Geneva", "Georgia", "Gill Sans", "Helvetica", "Helvetica Neue", "Lucida Grande",
        "Menlo", "Monaco", "Optima", "Times New Roman", "Verdana",
    ],
    plugins: &["PDF Viewer", "Chrome PDF Viewer", "Chromium PDF Viewer", "Microsoft Edge PDF Viewer", "WebKit built-in PDF"],
    screens: &[
        ScreenProfile { width: 1440, height: 900, avail_width: 1440, avail_height: 875, device_pixel_ratio: 2.0, color_depth: 30 },
        ScreenProfile { width: 1512, height: 982, avail_width: 1512, avail_height: 944, device_pixel_ratio: 2.0, color_depth: 30 },
        ScreenProfile { width: 1728, height: 1117, avail_width: 1728, avail_height: 1079, device_pixel_ratio: 2.0, color_depth: 30 },
    ],
    hardware_concurrency: &[8, 10, 12],
    device_memory: &[8, 16],
    tls_profiles: &["chrome-131-mac", "chrome-130-mac"],
    languages: &["en-US", "en"],
    timezone: "America/Los_Angeles",
};

static LINUX: PlatformRecord = PlatformRecord {
    platform: Platform::Linux,
    user_agents: &[
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    ],
    vendor: "Google Inc.",
    webgl: &[
        WebGlProfile {
            vendor: "Google Inc. (NVIDIA Corporation)",
            renderer: "ANGLE (NVIDIA Corporation, NVIDIA GeForce GTX 1660/PCIe/SSE2, OpenGL 4.5.0)",
        },
        WebGlProfile {
            vendor: "Google Inc. (Intel)",
            renderer: "ANGLE (Intel, Mesa Intel(R) UHD Graphics 620 (KBL GT2), OpenGL 4.6)",
        },
    ],
    fonts: &[
        "Arial", "Cantarell", "Courier New", "DejaVu Sans", "DejaVu Sans Mono", "DejaVu Serif",
        "Liberation Mono", "Liberation Sans", "Liberation Serif", "Noto Sans", "Noto Serif",
        "Ubuntu", "Ubuntu Mono",
    ],
    plugins: &["PDF Viewer", "Chrome PDF Viewer", "Chromium PDF Viewer", "Microsoft Edge PDF Viewer", "WebKit built-in PDF"],
    screens: &[
        ScreenProfile { width: 1920, height: 1080, avail_width: 1920, avail_height: 1053, device_pixel_ratio: 1.0, color_depth: 24 },
        ScreenProfile { width: 2560, height: 1440, avail_width: 2560, avail_height: 1413, device_pixel_ratio: 1.0, color_depth: 24 },
    ],
    hardware_concurrency: &[4, 8, 16],
    device_memory: &[8, 16, 32],
    tls_profiles: &["chrome-131-linux", "chrome-130-linux"],
    languages: &["en-US", "en"],
    timezone: "Etc/UTC",
};
