//! Limpieza de la salida de terminal antes de guardarla o mostrarla.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Secuencias introducidas por ESC:
/// - CSI: `ESC [` parámetros, intermedios y byte final (colores, cursor, borrado)
/// - OSC: `ESC ]` ... terminado en BEL o ST (`ESC \`)
/// - DCS / SOS / PM / APC: `ESC P|X|^|_` ... terminado en ST
/// - el resto: ESC + intermedios opcionales + un byte final (`ESC c`, `ESC ( B`, `ESC 7`)
static ESCAPE_SEQUENCES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-?]*[ -/]*[@-~]",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[PX^_][^\x1b]*\x1b\\",
        r"|\x1b[ -/]*[0-~]",
    ))
    .expect("regex de secuencias ESC")
});

/// Bytes de control C0 salvo tab, LF y CR, más DEL.
static CONTROL_BYTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").expect("regex de control"));

/// Quita secuencias de escape y bytes de control, dejando el texto imprimible
/// (incluido el no-ASCII) tal cual.
///
/// Es idempotente: después de la primera pasada no queda ningún ESC, así que
/// una segunda pasada no encuentra nada que quitar. Si no hay nada que quitar
/// devuelve el mismo `&str` prestado.
pub fn sanitize(text: &str) -> Cow<'_, str> {
    if text.is_empty() {
        return Cow::Borrowed(text);
    }

    match ESCAPE_SEQUENCES.replace_all(text, "") {
        Cow::Borrowed(untouched) => CONTROL_BYTES.replace_all(untouched, ""),
        Cow::Owned(stripped) => {
            let clean = match CONTROL_BYTES.replace_all(&stripped, "") {
                Cow::Borrowed(_) => None,
                Cow::Owned(clean) => Some(clean),
            };
            Cow::Owned(clean.unwrap_or(stripped))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(input: &str, expected: &str) {
        assert_eq!(sanitize(input), expected, "input: {input:?}");
    }

    #[test]
    fn quita_colores() {
        check("\x1b[31mRed text\x1b[0m", "Red text");
        check("\x1b[1;34mBold blue\x1b[0m", "Bold blue");
        check("\x1b[38;5;196mExtended color\x1b[0m", "Extended color");
        check("\x1b[48;2;255;0;0mTrue color bg\x1b[0m", "True color bg");
        check("[ \x1b[32mOK\x1b[0m ] Service started", "[ OK ] Service started");
        check("\x1b[1;4;31mBold underline red\x1b[0m", "Bold underline red");
    }

    #[test]
    fn quita_movimientos_de_cursor() {
        check("\x1b[2J\x1b[H", "");
        check("Line 1\x1b[A", "Line 1");
        check("Progress: \x1b[K50%", "Progress: 50%");
        check("\x1b[?25lhidden\x1b[?25h", "hidden");
    }

    #[test]
    fn quita_osc_y_dcs() {
        check("\x1b]0;window title\x07prompt$ ", "prompt$ ");
        check("\x1b]8;;http://x\x1b\\link\x1b]8;;\x1b\\", "link");
        check("a\x1bPq#0;2;0;0;0\x1b\\b", "ab");
        check("\x1bcreset", "reset");
        check("\x1b(Bascii", "ascii");
    }

    #[test]
    fn quita_bytes_de_control() {
        check("Hello\x00World", "HelloWorld");
        check("\x00\x00\x00Text\x00\x00", "Text");
        check("Text\x07here", "Texthere");
        check("Text\x08here", "Texthere");
        check("Text\x0bhere", "Texthere");
        check("Text\x0chere", "Texthere");
        check("Text\x7fhere", "Texthere");
    }

    #[test]
    fn conserva_espacios_y_saltos() {
        check("Line1\nLine2", "Line1\nLine2");
        check("Col1\tCol2", "Col1\tCol2");
        check("Line1\r\nLine2", "Line1\r\nLine2");
        check(
            "Line 1\nLine 2\n\x1b[32mLine 3\x1b[0m\n",
            "Line 1\nLine 2\nLine 3\n",
        );
    }

    #[test]
    fn conserva_texto_no_ascii() {
        let input = "Starting installation...\n\
                     \x1b[0;36m╔═══════╗\x1b[0m\n\
                     \x1b[0;36m║\x1b[0m  \x1b[1;37mDomain Config\x1b[0m\n\
                     \x1b[H\x1b[J\x00\x00\x00\
                     \x1b[0;32m✔\x1b[0m Готово\n";
        check(
            input,
            "Starting installation...\n╔═══════╗\n║  Domain Config\n✔ Готово\n",
        );
    }

    #[test]
    fn texto_plano_sin_cambios_y_prestado() {
        let plain = "Plain text without escape codes";
        assert!(matches!(sanitize(plain), Cow::Borrowed(s) if s == plain));
        assert!(matches!(sanitize(""), Cow::Borrowed("")));
    }

    #[test]
    fn es_idempotente() {
        let samples = [
            "\x1b[32mGreen\x1b[0m\x00\x00Text\x1b[H\x1b[J",
            "\x1b]0;unterminated title",
            "\x1b\x1b[31mdouble esc",
            "mixed \x1b[1m✔\x1b[0m\r\n\t end\x7f",
        ];
        for s in samples {
            let once = sanitize(s).into_owned();
            assert_eq!(sanitize(&once), once.as_str());
            assert!(!once.contains('\x1b'));
        }
    }
}
