//! Locale-aware messages for HTTP error statuses.
//!
//! The client turns every non-2xx status into a human readable message. Lookup
//! order for a status code:
//!
//! 1. the request's locale override, then the client's default locale; for each
//!    one the custom dictionary is tried before the built-in one, and a regional
//!    locale (`es-MX`) falls back to its base language (`es`);
//! 2. the built-in English dictionary;
//! 3. a generic message in the first requested language that has one.

use std::collections::HashMap;

const GENERIC_EN: &str = "An unexpected error occurred.";
const GENERIC_ES: &str = "Ocurrió un error inesperado.";

fn builtin(language: &str, status: u16) -> Option<&'static str> {
    match language {
        "en" => english(status),
        "es" => spanish(status),
        _ => None,
    }
}

fn english(status: u16) -> Option<&'static str> {
    Some(match status {
        400 => "Invalid request.",
        401 => "Authentication required.",
        403 => "You do not have permission to perform this action.",
        404 => "Resource not found.",
        405 => "Method not allowed.",
        408 => "The request timed out.",
        409 => "The request conflicts with the current state of the resource.",
        410 => "The resource is no longer available.",
        413 => "The request is too large.",
        415 => "Unsupported media type.",
        422 => "The submitted data is invalid.",
        429 => "Too many requests. Please try again later.",
        500 => "Internal server error.",
        502 => "Bad gateway.",
        503 => "Service unavailable.",
        504 => "Gateway timeout.",
        _ => return None,
    })
}

fn spanish(status: u16) -> Option<&'static str> {
    Some(match status {
        400 => "Solicitud no válida.",
        401 => "Se requiere autenticación.",
        403 => "No tiene permiso para realizar esta acción.",
        404 => "Recurso no encontrado.",
        405 => "Método no permitido.",
        408 => "La solicitud ha excedido el tiempo de espera.",
        409 => "La solicitud entra en conflicto con el estado actual del recurso.",
        410 => "El recurso ya no está disponible.",
        413 => "La solicitud es demasiado grande.",
        415 => "Tipo de contenido no admitido.",
        422 => "Los datos enviados no son válidos.",
        429 => "Demasiadas solicitudes. Inténtelo de nuevo más tarde.",
        500 => "Error interno del servidor.",
        502 => "Puerta de enlace incorrecta.",
        503 => "Servicio no disponible.",
        504 => "Tiempo de espera de la puerta de enlace agotado.",
        _ => return None,
    })
}

fn generic(language: &str) -> Option<&'static str> {
    match language {
        "en" => Some(GENERIC_EN),
        "es" => Some(GENERIC_ES),
        _ => None,
    }
}

/// Lowercased locale followed by its base language, if different.
fn candidates(locale: &str) -> Vec<String> {
    let locale = locale.trim().to_ascii_lowercase().replace('_', "-");
    let mut out = Vec::with_capacity(2);
    if locale.is_empty() {
        return out;
    }
    if let Some((language, _)) = locale.split_once('-') {
        let language = language.to_string();
        out.push(locale);
        out.push(language);
    } else {
        out.push(locale);
    }
    out
}

/// Status-code dictionaries, built-in plus caller supplied.
///
/// # Examples
///
/// ```
/// use querykit::Messages;
///
/// let messages = Messages::new().with_message("fr", 404, "Ressource introuvable.");
///
/// assert_eq!(messages.resolve(404, None, "en"), "Resource not found.");
/// assert_eq!(messages.resolve(404, Some("es-MX"), "en"), "Recurso no encontrado.");
/// assert_eq!(messages.resolve(404, Some("fr"), "en"), "Ressource introuvable.");
/// assert_eq!(messages.resolve(599, Some("es"), "en"), "Ocurrió un error inesperado.");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Messages {
    custom: HashMap<String, HashMap<u16, String>>,
}

impl Messages {
    /// Creates a dictionary set holding only the built-in messages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the message for `status` in `locale`.
    pub fn with_message(
        mut self,
        locale: impl AsRef<str>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        self.insert(locale, status, message);
        self
    }

    /// Adds or replaces the message for `status` in `locale`.
    pub fn insert(&mut self, locale: impl AsRef<str>, status: u16, message: impl Into<String>) {
        let locale = locale.as_ref().trim().to_ascii_lowercase().replace('_', "-");
        self.custom
            .entry(locale)
            .or_default()
            .insert(status, message.into());
    }

    /// Resolves the message for `status`.
    pub fn resolve(&self, status: u16, override_locale: Option<&str>, default_locale: &str) -> String {
        let mut requested: Vec<String> = Vec::new();
        for locale in override_locale.into_iter().chain(std::iter::once(default_locale)) {
            for candidate in candidates(locale) {
                if !requested.contains(&candidate) {
                    requested.push(candidate);
                }
            }
        }

        for locale in &requested {
            if let Some(message) = self.custom.get(locale).and_then(|m| m.get(&status)) {
                return message.clone();
            }
            if let Some(message) = builtin(locale, status) {
                return message.to_string();
            }
        }

        if let Some(message) = english(status) {
            return message.to_string();
        }

        requested
            .iter()
            .find_map(|locale| generic(locale))
            .unwrap_or(GENERIC_EN)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_english() {
        let messages = Messages::new();
        assert_eq!(messages.resolve(404, None, "en"), "Resource not found.");
        assert_eq!(messages.resolve(500, None, "en"), "Internal server error.");
    }

    #[test]
    fn test_override_locale_wins() {
        let messages = Messages::new();
        assert_eq!(messages.resolve(404, Some("es"), "en"), "Recurso no encontrado.");
        assert_eq!(messages.resolve(404, Some("en"), "es"), "Resource not found.");
    }

    #[test]
    fn test_custom_beats_builtin_for_same_locale() {
        let messages = Messages::new().with_message("en", 404, "Nothing here.");
        assert_eq!(messages.resolve(404, None, "en"), "Nothing here.");
        assert_eq!(messages.resolve(404, Some("es"), "en"), "Recurso no encontrado.");
    }

    #[test]
    fn test_unknown_locale_falls_back_to_english() {
        let messages = Messages::new();
        assert_eq!(messages.resolve(503, Some("de"), "de"), "Service unavailable.");
        assert_eq!(messages.resolve(418, Some("de"), "de"), GENERIC_EN);
    }

    #[test]
    fn test_regional_locale_uses_base_language() {
        let messages = Messages::new();
        assert_eq!(messages.resolve(401, Some("ES_ar"), "en"), "Se requiere autenticación.");
    }

    #[test]
    fn test_generic_follows_requested_language() {
        let messages = Messages::new();
        assert_eq!(messages.resolve(418, None, "es"), GENERIC_ES);
        assert_eq!(messages.resolve(418, None, "en"), GENERIC_EN);
    }
}
