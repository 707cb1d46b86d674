// API Versions
pub const VK_API_VERSION: &str = "5.131";

// API Base URLs
pub const VK_BASE_URL: &str = "https://api.vk.com/method";
pub const RUCAPTCHA_BASE_URL: &str = "https://rucaptcha.com";
pub const VK_PLAYLIST_URL_PREFIX: &str = "https://vk.com/music/album/";

// VK error codes
pub const VK_ERROR_TOO_MANY_REQUESTS: i64 = 6;
pub const VK_ERROR_CAPTCHA_NEEDED: i64 = 14;

// Automation loop cadence
pub const AUTOMATION_CYCLE_SECS: u64 = 600; // 10 minutes
pub const WINDOW_POLL_SECS: u64 = 60;
pub const RATE_LIMIT_RETRIES: u32 = 100;
pub const HTTP_TIMEOUT_SECS: u64 = 60;

// Jitter ranges (seconds)
pub const RATE_LIMIT_JITTER: (f64, f64) = (0.4, 0.6);
pub const CREATE_AD_JITTER: (f64, f64) = (2.9, 3.1);

// Decision thresholds
pub const CPM_RAISE_CEILING: f64 = 115.0;
pub const CPM_LOWER_CEILING: f64 = 35.1;
pub const CPM_STEP: f64 = 5.1;
pub const STOP_COST_MULTIPLIER: f64 = 1.2;

// Ads API limits
pub const ADS_UPDATE_BATCH: usize = 5;
pub const PLAYLISTS_PAGE_SIZE: u32 = 200;
pub const EXECUTE_BATCH: usize = 10;
pub const RELATED_ARTISTS_CAP: usize = 150;

// New ad defaults
pub const DEFAULT_AD_CPM: f64 = 30.0;
pub const DEFAULT_AD_LIMIT: i64 = 100;
pub const MUSIC_CATEGORY_ID: i64 = 51;
pub const MUSIC_INTEREST_ID: i64 = 10010;
pub const SMARTPHONE_DEVICES: i64 = 1001;

// Captcha polling
pub const CAPTCHA_POLL_SECS: u64 = 5;
pub const CAPTCHA_MAX_POLLS: u32 = 24;
