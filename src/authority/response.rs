//! Tolerant parsing of authority responses.
//!
//! Element names are matched on their local part so namespace prefixes do
//! not matter. Anything without a recognizable accepted marker and a
//! confirmation code is treated as a rejection.

use crate::document::xml::unescape;
use crate::domain::AuthorityResult;

/// Status values that mean the registration was taken.
pub const ACCEPTED_MARKERS: &[&str] = &["Correcto", "AceptadoConErrores"];

pub const STATUS_ELEMENTS: &[&str] = &["EstadoRegistro", "EstadoEnvio"];
pub const CONFIRMATION_ELEMENT: &str = "CSV";
pub const ERROR_CODE_ELEMENT: &str = "CodigoErrorRegistro";
pub const ERROR_MESSAGE_ELEMENT: &str = "DescripcionErrorRegistro";

pub const CODE_REJECTED: &str = "REJECTED";
pub const CODE_NO_CONFIRMATION: &str = "NO_CONFIRMATION_CODE";

/// Text of the first element whose local name is `local_name`.
pub fn find_element(raw: &str, local_name: &str) -> Option<String> {
    let mut rest = raw;
    while let Some(lt) = rest.find('<') {
        rest = &rest[lt + 1..];
        if rest.starts_with('/') || rest.starts_with('?') || rest.starts_with('!') {
            continue;
        }
        let end = rest.find('>')?;
        let tag = &rest[..end];
        if tag.ends_with('/') {
            continue;
        }
        let name = tag.split_whitespace().next().unwrap_or("");
        let local = name.rsplit(':').next().unwrap_or(name);
        if local == local_name {
            let body = &rest[end + 1..];
            let text_end = body.find('<').unwrap_or(body.len());
            return Some(unescape(body[..text_end].trim()));
        }
    }
    None
}

/// Interpret a raw authority answer.
pub fn parse_response(raw: &str) -> AuthorityResult {
    let status = STATUS_ELEMENTS
        .iter()
        .find_map(|element| find_element(raw, element));
    let accepted = status
        .as_deref()
        .map(|s| ACCEPTED_MARKERS.contains(&s))
        .unwrap_or(false);
    let confirmation = find_element(raw, CONFIRMATION_ELEMENT).filter(|c| !c.is_empty());

    let result = match (accepted, confirmation) {
        (true, Some(code)) => AuthorityResult::accepted(status.unwrap_or_default(), code),
        (true, None) => AuthorityResult::rejected(
            CODE_NO_CONFIRMATION,
            "accepted marker without a confirmation code",
        ),
        (false, _) => {
            let code = find_element(raw, ERROR_CODE_ELEMENT)
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| CODE_REJECTED.to_string());
            let message = find_element(raw, ERROR_MESSAGE_ELEMENT)
                .filter(|m| !m.is_empty())
                .or_else(|| status.map(|s| format!("registration status {s}")))
                .unwrap_or_else(|| "no accepted marker in authority response".to_string());
            AuthorityResult::rejected(code, message)
        }
    };
    result.with_raw_response(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_with_confirmation_code() {
        let raw = r#"<env:Envelope xmlns:env="e"><tikR:RespuestaRegFactuSistemaFacturacion>
            <tikR:CSV>A-YDSW8NLFLANWPM</tikR:CSV>
            <tikR:EstadoEnvio>Correcto</tikR:EstadoEnvio>
            </tikR:RespuestaRegFactuSistemaFacturacion></env:Envelope>"#;
        let result = parse_response(raw);
        assert!(result.success);
        assert_eq!(result.confirmation_code.as_deref(), Some("A-YDSW8NLFLANWPM"));
        assert_eq!(result.raw_response.as_deref(), Some(raw));
    }

    #[test]
    fn accepted_with_warnings_counts_as_accepted() {
        let raw = "<EstadoRegistro>AceptadoConErrores</EstadoRegistro><CSV>X1</CSV>";
        assert!(parse_response(raw).success);
    }

    #[test]
    fn explicit_rejection_carries_authority_code() {
        let raw = "<r:EstadoRegistro>Incorrecto</r:EstadoRegistro>\
                   <r:CodigoErrorRegistro>1100</r:CodigoErrorRegistro>\
                   <r:DescripcionErrorRegistro>NIF &lt;no&gt; identificado</r:DescripcionErrorRegistro>";
        let result = parse_response(raw);
        assert!(!result.success);
        assert_eq!(result.code, "1100");
        assert_eq!(result.message, "NIF <no> identificado");
        assert!(!result.is_transport_failure());
    }

    #[test]
    fn unrecognized_responses_fail_closed() {
        for raw in ["", "OK", "<html>maintenance</html>", "<EstadoEnvio>Maybe</EstadoEnvio>"] {
            let result = parse_response(raw);
            assert!(!result.success, "{raw:?} should not be accepted");
        }
    }

    #[test]
    fn accepted_marker_without_code_is_rejected() {
        let result = parse_response("<EstadoEnvio>Correcto</EstadoEnvio><CSV/>");
        assert!(!result.success);
        assert_eq!(result.code, CODE_NO_CONFIRMATION);
    }

    #[test]
    fn closing_and_self_closing_tags_are_skipped() {
        assert_eq!(find_element("<a/><b>x</b>", "a"), None);
        assert_eq!(find_element("</CSV><p:CSV attr=\"1\"> y </p:CSV>", "CSV").as_deref(), Some("y"));
    }
}
