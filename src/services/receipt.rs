use std::fmt::Write;

use crate::models::booking::Booking;
use crate::models::retreat::Retreat;

pub const RECEIPT_FILENAME: &str = "booking-receipt.txt";

/// `12345` in minor units -> `123.45 EUR`.
pub fn format_amount(minor_units: i64, currency: &str) -> String {
    let sign = if minor_units < 0 { "-" } else { "" };
    let abs = minor_units.unsigned_abs();
    format!("{}{}.{:02} {}", sign, abs / 100, abs % 100, currency.to_uppercase())
}

/// Plain-text receipt attached to the confirmation email.
pub fn render_receipt(booking: &Booking, retreat: &Retreat) -> Vec<u8> {
    let mut out = String::new();
    let _ = writeln!(out, "BOOKING RECEIPT");
    let _ = writeln!(out, "===============");
    let _ = writeln!(out, "Booking:   {}", booking.id);
    let _ = writeln!(out, "Retreat:   {}", retreat.title);
    if let Some(location) = &retreat.location {
        let _ = writeln!(out, "Location:  {}", location);
    }
    let _ = writeln!(
        out,
        "Session:   {} - {}",
        booking.session_start.format("%Y-%m-%d"),
        booking.session_end.format("%Y-%m-%d")
    );
    let _ = writeln!(out, "Seats:     {}", booking.seat_count);
    let _ = writeln!(out, "Total:     {}", format_amount(booking.total_price, &booking.currency));
    if let Some(payment_intent_id) = &booking.payment_intent_id {
        let _ = writeln!(out, "Payment:   {}", payment_intent_id);
    }

    if !booking.participants.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Participants:");
        for p in &booking.participants {
            let _ = writeln!(out, "  - {} {} <{}>", p.first_name, p.last_name, p.email);
        }
    }

    if let Some(address) = &booking.billing_address {
        let _ = writeln!(out);
        let _ = writeln!(out, "Billed to:");
        let _ = writeln!(out, "  {}", address.line1);
        if let Some(line2) = &address.line2 {
            let _ = writeln!(out, "  {}", line2);
        }
        let _ = writeln!(out, "  {} {}, {}", address.postal_code, address.city, address.country);
    }

    out.into_bytes()
}
