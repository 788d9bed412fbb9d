// ABOUTME: Pure text renderers used by the message conversion pipeline
// ABOUTME: Dice outcomes, geo URIs and map links, poll enumerations, contact cards

use crate::ids::ShortMessageId;
use crate::media::{Contact, DiceKind, GeoPoint, Poll};

/// Render a game-of-chance outcome as a human-readable result line.
///
/// The numeric value is what the remote protocol rolled; the mapping of
/// values to outcomes is fixed per dice kind.
pub fn render_dice(kind: DiceKind, value: i32) -> String {
    match kind {
        DiceKind::Die => format!("\u{1F3B2} Rolled a {}", value),
        DiceKind::Dart => {
            let outcome = match value {
                1 => "missed the board",
                2 | 3 => "hit the outer ring",
                4 | 5 => "hit the inner ring",
                6 => "bullseye!",
                _ => "threw a dart",
            };
            format!("\u{1F3AF} {}", outcome)
        }
        DiceKind::Basketball => {
            let outcome = match value {
                1 | 2 => "missed the basket",
                3 => "bounced off the rim",
                4 | 5 => "scored!",
                _ => "threw the ball",
            };
            format!("\u{1F3C0} {}", outcome)
        }
        DiceKind::Bowling => {
            let outcome = match value {
                1 => "gutter ball",
                2 => "knocked down one pin",
                3 => "knocked down three pins",
                4 => "knocked down four pins",
                5 => "knocked down five pins, one wobbling",
                6 => "strike!",
                _ => "rolled the ball",
            };
            format!("\u{1F3B3} {}", outcome)
        }
        DiceKind::Football => {
            let outcome = match value {
                1 | 2 => "missed the goal",
                3 => "hit the post",
                4 | 5 => "goal!",
                _ => "kicked the ball",
            };
            format!("\u{26BD} {}", outcome)
        }
        DiceKind::SlotMachine => render_slot_machine(value),
    }
}

const SLOT_SYMBOLS: [&str; 4] = ["bar", "\u{1F352}", "\u{1F34B}", "7\u{FE0F}\u{20E3}"];

/// Slot machine values are 1..=64: `value - 1` decomposed base-4 gives the
/// three reel symbols, least significant digit first.
fn render_slot_machine(value: i32) -> String {
    let v = (value - 1).clamp(0, 63) as usize;
    let reels = [
        SLOT_SYMBOLS[v % 4],
        SLOT_SYMBOLS[(v / 4) % 4],
        SLOT_SYMBOLS[(v / 16) % 4],
    ];
    let result = if reels[0] == reels[1] && reels[1] == reels[2] {
        "jackpot!"
    } else {
        "no luck"
    };
    format!(
        "\u{1F3B0} {} {} {} \u{2014} {}",
        reels[0], reels[1], reels[2], result
    )
}

/// Geo URI per RFC 5870, coordinates rounded to 6 decimal places.
pub fn geo_uri(point: &GeoPoint) -> String {
    format!("geo:{:.6},{:.6}", point.lat, point.long)
}

/// Human-readable coordinate string with hemisphere suffixes.
pub fn format_coordinates(point: &GeoPoint) -> String {
    let lat_dir = if point.lat >= 0.0 { "N" } else { "S" };
    let long_dir = if point.long >= 0.0 { "E" } else { "W" };
    format!(
        "{:.4}\u{00B0} {}, {:.4}\u{00B0} {}",
        point.lat.abs(),
        lat_dir,
        point.long.abs(),
        long_dir
    )
}

/// Deep link into a public map service for the given point.
pub fn map_link(point: &GeoPoint) -> String {
    format!(
        "https://www.openstreetmap.org/?mlat={:.6}&mlon={:.6}",
        point.lat, point.long
    )
}

/// Parse a `geo:` URI back into a point. Returns None on anything malformed;
/// callers downgrade that to a logged fallback, not an error.
pub fn parse_geo_uri(uri: &str) -> Option<GeoPoint> {
    let rest = uri.strip_prefix("geo:")?;
    // Strip any ;params and ?query the client appended
    let coords = rest.split([';', '?']).next()?;
    let mut parts = coords.split(',');
    let lat = parts.next()?.trim().parse::<f64>().ok()?;
    let long = parts.next()?.trim().parse::<f64>().ok()?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&long) {
        return None;
    }
    Some(GeoPoint { lat, long })
}

/// Render a poll as a numbered option list plus the vote command carrying
/// the packed message identity.
pub fn render_poll(poll: &Poll, short_id: ShortMessageId, command_prefix: &str) -> String {
    let mut out = format!("Poll: {}\n", poll.question);
    for (i, answer) in poll.answers.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, answer));
    }
    if poll.closed {
        out.push_str("This poll is closed.");
    } else {
        out.push_str(&format!(
            "Vote with {} vote {} <choice number>",
            command_prefix, short_id
        ));
    }
    out
}

/// Render an interactive game as a notice with its play command.
pub fn render_game(title: &str, description: &str, short_id: ShortMessageId, command_prefix: &str) -> String {
    let mut out = format!("Game: {}", title);
    if !description.is_empty() {
        out.push_str(&format!("\n{}", description));
    }
    out.push_str(&format!("\nPlay with {} play {}", command_prefix, short_id));
    out
}

/// Render a contact card. Phone numbers already in international form are
/// kept; bare national numbers are passed through with a leading plus only
/// when they look like a full international number.
pub fn render_contact(contact: &Contact) -> String {
    let phone = format_phone(&contact.phone_number);
    format!("Shared contact: {} ({})", contact.full_name(), phone)
}

/// Best-effort international phone formatting. The remote side strips the
/// leading plus, so digit-only values of plausible length get it back.
pub fn format_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('+') {
        return trimmed.to_string();
    }
    if trimmed.len() >= 7 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return format!("+{}", trimmed);
    }
    trimmed.to_string()
}

/// A caption equal to the attachment's filename carries no information and
/// is treated as absent.
pub fn effective_caption<'a>(caption: &'a str, file_name: Option<&str>) -> Option<&'a str> {
    let caption = caption.trim();
    if caption.is_empty() {
        return None;
    }
    if let Some(name) = file_name {
        if caption == name {
            return None;
        }
    }
    Some(caption)
}

/// Notice shown in place of media the pipeline cannot convert.
pub fn unsupported_notice(type_name: &str) -> String {
    format!(
        "Unsupported media type {} \u{2014} this message could not be bridged. \
         Updating the bridge may add support.",
        type_name
    )
}
