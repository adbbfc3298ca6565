use boovpn_db::DeviceSlots;
use reqwest::Url;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Ios,
    Android,
    Windows,
    MacOs,
}

impl Platform {
    pub const ALL: [Platform; 4] = [Platform::Ios, Platform::Android, Platform::MacOs, Platform::Windows];

    fn key(self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Windows => "windows",
            Platform::MacOs => "mac",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Platform::Ios => "📱 iOS",
            Platform::Android => "📱 Android",
            Platform::Windows => "🖥 Windows",
            Platform::MacOs => "🖥 macOS",
        }
    }

    pub fn download_url(self) -> &'static str {
        match self {
            Platform::Ios => "https://apps.apple.com/app/outline-app/id1356177741",
            Platform::Android => "https://play.google.com/store/apps/details?id=org.outline.android.client",
            Platform::Windows => "https://getoutline.org/get-started/#step-3",
            Platform::MacOs => "https://apps.apple.com/app/outline-secure-internet-access/id1356178125",
        }
    }
}

/// Everything a button can ask the bot to do. Callback data is the
/// `Display` form and parses back with [`CallbackAction::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    GetStarted,
    MainMenu,
    Devices,
    Device(usize),
    NewDevice(usize),
    DeleteDevice(usize),
    Guide,
    PlatformGuide(Platform),
    Pay,
    Support,
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        let action = match data {
            "get_started" => Self::GetStarted,
            "get_main" => Self::MainMenu,
            "get_config" => Self::Devices,
            "get_guide" => Self::Guide,
            "pay_method" => Self::Pay,
            "get_support" => Self::Support,
            _ => {
                if let Some(n) = data.strip_prefix("get_device") {
                    Self::Device(n.parse().ok()?)
                } else if let Some(n) = data.strip_prefix("new_device") {
                    Self::NewDevice(n.parse().ok()?)
                } else if let Some(n) = data.strip_prefix("delete_device") {
                    Self::DeleteDevice(n.parse().ok()?)
                } else {
                    let key = data.strip_prefix("get_")?.strip_suffix("_guide")?;
                    Self::PlatformGuide(Platform::ALL.into_iter().find(|p| p.key() == key)?)
                }
            }
        };
        Some(action)
    }
}

impl std::fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GetStarted => write!(f, "get_started"),
            Self::MainMenu => write!(f, "get_main"),
            Self::Devices => write!(f, "get_config"),
            Self::Device(n) => write!(f, "get_device{}", n),
            Self::NewDevice(n) => write!(f, "new_device{}", n),
            Self::DeleteDevice(n) => write!(f, "delete_device{}", n),
            Self::Guide => write!(f, "get_guide"),
            Self::PlatformGuide(p) => write!(f, "get_{}_guide", p.key()),
            Self::Pay => write!(f, "pay_method"),
            Self::Support => write!(f, "get_support"),
        }
    }
}

fn button(text: impl Into<String>, action: CallbackAction) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(text, action.to_string())
}

fn back_to_main() -> Vec<InlineKeyboardButton> {
    vec![button("🏡 Main menu", CallbackAction::MainMenu)]
}

fn support_button(support_url: Option<&str>) -> InlineKeyboardButton {
    match support_url.and_then(|u| Url::parse(u).ok()) {
        Some(url) => InlineKeyboardButton::url("🆘 Contact support", url),
        None => button("🆘 Contact support", CallbackAction::Support),
    }
}

pub fn welcome_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button("🚀 Get started", CallbackAction::GetStarted)]])
}

pub fn main_menu(support_url: Option<&str>) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![button("💳 Pay", CallbackAction::Pay)],
        vec![button("📶 My devices", CallbackAction::Devices)],
        vec![support_button(support_url)],
        vec![button("⚙️ Setup guide", CallbackAction::Guide)],
    ])
}

pub fn guide_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            button(Platform::Ios.label(), CallbackAction::PlatformGuide(Platform::Ios)),
            button(Platform::Android.label(), CallbackAction::PlatformGuide(Platform::Android)),
        ],
        vec![
            button(Platform::MacOs.label(), CallbackAction::PlatformGuide(Platform::MacOs)),
            button(Platform::Windows.label(), CallbackAction::PlatformGuide(Platform::Windows)),
        ],
        back_to_main(),
    ])
}

pub fn platform_guide_keyboard(platform: Platform) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    if let Ok(url) = Url::parse(platform.download_url()) {
        rows.push(vec![InlineKeyboardButton::url("⬇️ Download the app", url)]);
    }
    rows.push(vec![button("⬅️ Back", CallbackAction::Guide)]);
    rows.push(back_to_main());
    InlineKeyboardMarkup::new(rows)
}

/// One row per slot: open a provisioned device or create one in an empty slot.
pub fn devices_keyboard(slots: &DeviceSlots) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = slots
        .iter()
        .map(|(slot, credential)| match credential {
            Some(_) => vec![button(format!("📱 Device {}", slot), CallbackAction::Device(slot))],
            None => vec![button(
                format!("➕ Add device {}", slot),
                CallbackAction::NewDevice(slot),
            )],
        })
        .collect();
    rows.push(back_to_main());
    InlineKeyboardMarkup::new(rows)
}

pub fn device_keyboard(slot: usize) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![button("🗑 Delete device", CallbackAction::DeleteDevice(slot))],
        vec![button("⬅️ My devices", CallbackAction::Devices)],
        back_to_main(),
    ])
}

pub fn pay_keyboard(support_url: Option<&str>) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![button("💳 Pay", CallbackAction::Pay)],
        vec![support_button(support_url)],
        back_to_main(),
    ])
}

pub fn support_keyboard(support_url: Option<&str>) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![support_button(support_url)], back_to_main()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::InlineKeyboardButtonKind;

    #[test]
    fn callback_data_parses_back() {
        let actions = [
            CallbackAction::GetStarted,
            CallbackAction::MainMenu,
            CallbackAction::Devices,
            CallbackAction::Device(2),
            CallbackAction::NewDevice(3),
            CallbackAction::DeleteDevice(1),
            CallbackAction::Guide,
            CallbackAction::PlatformGuide(Platform::MacOs),
            CallbackAction::Pay,
            CallbackAction::Support,
        ];
        for action in actions {
            assert_eq!(CallbackAction::parse(&action.to_string()), Some(action));
        }
    }

    #[test]
    fn legacy_callback_strings() {
        assert_eq!(CallbackAction::parse("get_device3"), Some(CallbackAction::Device(3)));
        assert_eq!(
            CallbackAction::parse("get_ios_guide"),
            Some(CallbackAction::PlatformGuide(Platform::Ios))
        );
        assert_eq!(CallbackAction::parse("get_device"), None);
        assert_eq!(CallbackAction::parse("get_linux_guide"), None);
        assert_eq!(CallbackAction::parse("something_else"), None);
    }

    #[test]
    fn devices_keyboard_offers_open_or_add() {
        let mut slots = DeviceSlots::new(3);
        slots.set(2, Some("ss://two".into()));

        let kb = devices_keyboard(&slots);
        let data: Vec<String> = kb
            .inline_keyboard
            .iter()
            .flatten()
            .filter_map(|b| match &b.kind {
                InlineKeyboardButtonKind::CallbackData(d) => Some(d.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(data, vec!["new_device1", "get_device2", "new_device3", "get_main"]);
    }

    #[test]
    fn support_falls_back_to_callback() {
        let kb = main_menu(None);
        assert!(matches!(
            &kb.inline_keyboard[2][0].kind,
            InlineKeyboardButtonKind::CallbackData(d) if d == "get_support"
        ));

        let kb = main_menu(Some("https://t.me/boovpn_support"));
        assert!(matches!(&kb.inline_keyboard[2][0].kind, InlineKeyboardButtonKind::Url(_)));
    }
}
