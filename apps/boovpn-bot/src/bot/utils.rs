use boovpn_db::Subscriber;
use chrono::{DateTime, Utc};

use crate::bot::keyboards::Platform;

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Main menu header for a returning subscriber.
pub fn status_text(sub: &Subscriber, now: DateTime<Utc>) -> String {
    if sub.is_friend {
        return "🤝 You are using the service for free!".to_string();
    }
    if !sub.is_active {
        return "💳 Pay for a subscription to keep using the service.".to_string();
    }

    let days = sub.days_left(now).unwrap_or(0).max(0);
    if sub.is_trial {
        format!(
            "🎁 Days left in your trial: <b>{}</b>\n\n\
            You can pay now, the paid period is added on top of the remaining days.",
            days
        )
    } else {
        format!("✅ Days left in your subscription: <b>{}</b>", days)
    }
}

pub fn welcome_text() -> String {
    "👋 <b>Welcome to Boo VPN!</b>\n\n\
    Your free trial has started. Press the button below to get your first VPN key."
        .to_string()
}

pub fn guide_text(credential: Option<&str>) -> String {
    let mut text = "⚙️ <b>Setup guide</b>\n\n\
        Choose your operating system to see step-by-step instructions and a download link."
        .to_string();
    if let Some(credential) = credential {
        text.push_str(&format!(
            "\n\n🟢 Tap the key to copy it:\n<pre>{}</pre>",
            escape_html(credential)
        ));
    }
    text
}

pub fn platform_guide_text(platform: Platform) -> String {
    format!(
        "{} <b>setup</b>\n\n\
        1. Install Outline from the link below.\n\
        2. Open <b>My devices</b> in this bot and copy a key.\n\
        3. In Outline, tap <b>+</b> and paste the key.\n\
        4. Press <b>Connect</b>.",
        platform.label()
    )
}

pub fn devices_text() -> String {
    "📶 <b>My devices</b>\n\nOpen an existing device or add a new one.".to_string()
}

pub fn device_text(slot: usize, credential: &str) -> String {
    format!(
        "📱 <b>Device {}</b>\n\nTap the key to copy it:\n<pre>{}</pre>",
        slot,
        escape_html(credential)
    )
}

pub fn pay_text(subscriber_id: i64) -> String {
    format!(
        "💳 <b>Payment</b>\n\n\
        Contact support to top up and mention your ID: <code>{}</code>.\n\
        Paid days are added as soon as the payment arrives.",
        subscriber_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use boovpn_db::{DeviceSlots, MAX_DEVICE_SLOTS};
    use chrono::Duration;

    fn sub(now: DateTime<Utc>) -> Subscriber {
        Subscriber {
            id: 42,
            balance: 0,
            is_trial: true,
            is_active: true,
            is_friend: false,
            subscription_end_date: Some(now + Duration::hours(30)),
            last_notice_on: None,
            device_slots: DeviceSlots::new(MAX_DEVICE_SLOTS),
        }
    }

    #[test]
    fn status_depends_on_flags() {
        let now = Utc::now();
        let mut s = sub(now);
        assert!(status_text(&s, now).contains("trial: <b>2</b>"));

        s.is_trial = false;
        assert!(status_text(&s, now).contains("subscription: <b>2</b>"));

        s.is_active = false;
        assert!(status_text(&s, now).starts_with("💳"));

        s.is_friend = true;
        assert!(status_text(&s, now).contains("free"));
    }

    #[test]
    fn credentials_are_escaped() {
        let text = device_text(1, "ss://a<b>&c");
        assert!(text.contains("ss://a&lt;b&gt;&amp;c"));
    }
}
