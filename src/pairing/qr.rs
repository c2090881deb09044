//! QR rendering for the pairing payload: ASCII-block output for a terminal.

use qrcodegen::{QrCode, QrCodeEcc};

use crate::crypto::MasterSecret;
use crate::signaling::QrPayload;

/// Render the QR payload for `master_secret` as a block of ASCII suitable
/// for printing directly to a terminal.
pub fn render_ascii_qr(master_secret: &MasterSecret) -> anyhow::Result<String> {
    let payload = QrPayload::new(master_secret).encode();
    let qr = QrCode::encode_text(&payload, QrCodeEcc::Medium).map_err(|e| anyhow::anyhow!("QR encoding failed: {e}"))?;
    Ok(to_ascii(&qr))
}

fn to_ascii(qr: &QrCode) -> String {
    let border = 2;
    let size = qr.size();
    let mut out = String::new();
    for y in -border..size + border {
        for x in -border..size + border {
            let dark = qr.get_module(x, y);
            out.push(if dark { '\u{2588}' } else { ' ' });
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_nonempty_ascii_block() {
        let ms = [3u8; 32];
        let ascii = render_ascii_qr(&ms).unwrap();
        assert!(ascii.contains('\u{2588}'));
        assert!(ascii.lines().count() > 4);
    }
}
