/// Repositorio de scripts por defecto.
pub const DEFAULT_SCRIPTS_BASE_URL: &str =
    "https://raw.githubusercontent.com/andchir/install_scripts/refs/heads/main/scripts";

/// Convierte el texto "extra" en argumentos de shell.
///
/// Se parte por espacios y cada token va entre comillas simples; una comilla
/// simple dentro de un token se cierra, se emite entre dobles y se reabre
/// (`'` -> `'"'"'`), así el token sigue siendo una sola palabra para el shell
/// remoto.
pub fn escape_shell_args(extra: &str) -> String {
    extra
        .split_whitespace()
        .map(|arg| format!("'{}'", arg.replace('\'', "'\"'\"'")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Comando que se ejecuta en el host remoto: descarga `<script>.sh` y lo
/// pasa a bash, con los argumentos extra si los hay.
pub fn build_install_command(scripts_base_url: &str, script: &str, extra: &str) -> String {
    let url = format!("{}/{}.sh", scripts_base_url.trim_end_matches('/'), script);
    let args = escape_shell_args(extra);
    if args.is_empty() {
        format!("curl -fsSL -o- {url} | bash")
    } else {
        format!("curl -fsSL -o- {url} | bash -s -- {args}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapa_argumentos() {
        let casos = [
            ("", ""),
            ("domain.com", "'domain.com'"),
            ("arg1 arg2", "'arg1' 'arg2'"),
            ("example.com password123", "'example.com' 'password123'"),
            ("  spaced  args  ", "'spaced' 'args'"),
            ("it's-a-test", "'it'\"'\"'s-a-test'"),
            (
                "arg'with'quotes another",
                "'arg'\"'\"'with'\"'\"'quotes' 'another'",
            ),
        ];
        for (input, esperado) in casos {
            assert_eq!(escape_shell_args(input), esperado, "input: {input:?}");
        }
    }

    #[test]
    fn inyeccion_queda_como_literal() {
        let out = escape_shell_args("$(rm -rf /);reboot");
        assert_eq!(out, "'$(rm' '-rf' '/);reboot'");
    }

    #[test]
    fn comando_sin_extra() {
        let cmd = build_install_command("https://example.com/scripts/", "demo", "   ");
        assert_eq!(cmd, "curl -fsSL -o- https://example.com/scripts/demo.sh | bash");
    }

    #[test]
    fn comando_con_extra() {
        let cmd = build_install_command("https://example.com/scripts", "demo", "example.com");
        assert_eq!(
            cmd,
            "curl -fsSL -o- https://example.com/scripts/demo.sh | bash -s -- 'example.com'"
        );
    }
}
