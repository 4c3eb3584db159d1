use chrono::NaiveDate;

use crate::services::form::FieldKey;

/// An inbound event after the transport layer has unpacked the provider payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Text(String),
    Selection { id: String },
    Audio { media_id: String },
    Unsupported { kind: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    Next,
    Prev,
}

/// Every inbound event is parsed into one of these before stage dispatch, so a
/// handler can match exhaustively instead of sniffing string prefixes.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Cancel,
    Help,
    Greeting,
    Menu,
    Receipt,
    Service(String),
    Day(NaiveDate),
    Slot(i64),
    Page(PageDirection),
    Confirm,
    Edit,
    Decline,
    EditField(FieldKey),
    Affirm,
    Deny,
    Skip,
    Audio,
    Unsupported,
    Text(String),
    /// A selection id that no current message could have produced.
    Unknown(String),
}

pub const SERVICE_PREFIX: &str = "serv_";
pub const DAY_PREFIX: &str = "day_";
pub const SLOT_PREFIX: &str = "slot_";
pub const EDIT_PREFIX: &str = "edit_";

pub const ID_MENU: &str = "menu";
pub const ID_CANCEL: &str = "cancel";
pub const ID_HELP: &str = "help";
pub const ID_RECEIPT: &str = "receipt";
pub const ID_PAGE_NEXT: &str = "page_next";
pub const ID_PAGE_PREV: &str = "page_prev";
pub const ID_CONFIRM_YES: &str = "confirm_yes";
pub const ID_CONFIRM_EDIT: &str = "confirm_edit";
pub const ID_CONFIRM_NO: &str = "confirm_no";
pub const ID_PHONE_YES: &str = "phone_yes";
pub const ID_PHONE_NO: &str = "phone_no";
pub const ID_EMAIL_SKIP: &str = "email_skip";

const CANCEL_WORDS: &[&str] = &["cancelar", "cancela", "salir", "reiniciar", "cancel", "stop"];
const HELP_WORDS: &[&str] = &["ayuda", "help", "?"];
const GREETING_WORDS: &[&str] = &[
    "hola",
    "holi",
    "buenas",
    "buen dia",
    "buenos dias",
    "buenas tardes",
    "buenas noches",
    "hi",
    "hello",
    "inicio",
    "empezar",
];
const MENU_WORDS: &[&str] = &["menu", "servicios", "volver"];
const RECEIPT_WORDS: &[&str] = &["comprobante", "recibo", "constancia"];
const CONFIRM_WORDS: &[&str] = &["confirmar", "confirmo", "confirm"];
const EDIT_WORDS: &[&str] = &["editar", "corregir", "modificar", "edit"];
const AFFIRM_WORDS: &[&str] = &["si", "sip", "claro", "ok", "okay", "correcto", "dale", "yes", "de acuerdo"];
const DENY_WORDS: &[&str] = &["no", "nop", "negativo", "nel"];
const SKIP_WORDS: &[&str] = &["omitir", "saltar", "skip", "ninguno", "sin correo"];
const NEXT_WORDS: &[&str] = &["mas", "ver mas", "siguiente"];
const PREV_WORDS: &[&str] = &["atras", "anterior", "volver atras"];

impl Command {
    pub fn from_event(event: &InboundEvent) -> Self {
        match event {
            InboundEvent::Text(text) => Self::parse_text(text),
            InboundEvent::Selection { id } => Self::parse_selection(id),
            InboundEvent::Audio { .. } => Command::Audio,
            InboundEvent::Unsupported { .. } => Command::Unsupported,
        }
    }

    pub fn parse_selection(id: &str) -> Self {
        let id = id.trim();
        match id {
            ID_MENU => return Command::Menu,
            ID_CANCEL => return Command::Cancel,
            ID_HELP => return Command::Help,
            ID_RECEIPT => return Command::Receipt,
            ID_PAGE_NEXT => return Command::Page(PageDirection::Next),
            ID_PAGE_PREV => return Command::Page(PageDirection::Prev),
            ID_CONFIRM_YES => return Command::Confirm,
            ID_CONFIRM_EDIT => return Command::Edit,
            ID_CONFIRM_NO => return Command::Decline,
            ID_PHONE_YES => return Command::Affirm,
            ID_PHONE_NO => return Command::Deny,
            ID_EMAIL_SKIP => return Command::Skip,
            _ => {}
        }

        if let Some(rest) = id.strip_prefix(SERVICE_PREFIX) {
            if !rest.is_empty() {
                return Command::Service(rest.to_string());
            }
        } else if let Some(rest) = id.strip_prefix(DAY_PREFIX) {
            if let Ok(date) = NaiveDate::parse_from_str(rest, "%Y-%m-%d") {
                return Command::Day(date);
            }
        } else if let Some(rest) = id.strip_prefix(SLOT_PREFIX) {
            if let Ok(slot_id) = rest.parse::<i64>() {
                return Command::Slot(slot_id);
            }
        } else if let Some(rest) = id.strip_prefix(EDIT_PREFIX) {
            if let Some(key) = FieldKey::parse(rest) {
                return Command::EditField(key);
            }
        }

        Command::Unknown(id.to_string())
    }

    /// Keyword commands match the whole folded message; anything else is
    /// passed through verbatim for the stage handler to interpret.
    pub fn parse_text(text: &str) -> Self {
        let folded = fold(text);
        let is = |words: &[&str]| words.contains(&folded.as_str());

        if is(CANCEL_WORDS) {
            Command::Cancel
        } else if is(HELP_WORDS) {
            Command::Help
        } else if is(GREETING_WORDS) {
            Command::Greeting
        } else if is(MENU_WORDS) {
            Command::Menu
        } else if is(RECEIPT_WORDS) {
            Command::Receipt
        } else if is(CONFIRM_WORDS) {
            Command::Confirm
        } else if is(EDIT_WORDS) {
            Command::Edit
        } else if is(NEXT_WORDS) {
            Command::Page(PageDirection::Next)
        } else if is(PREV_WORDS) {
            Command::Page(PageDirection::Prev)
        } else {
            Command::Text(text.trim().to_string())
        }
    }
}

pub fn is_affirmative(text: &str) -> bool {
    let folded = fold(text);
    AFFIRM_WORDS.contains(&folded.as_str()) || CONFIRM_WORDS.contains(&folded.as_str())
}

pub fn is_negative(text: &str) -> bool {
    DENY_WORDS.contains(&fold(text).as_str())
}

pub fn is_skip(text: &str) -> bool {
    SKIP_WORDS.contains(&fold(text).as_str())
}

/// Lowercase, strip Spanish diacritics and surrounding punctuation, and collapse
/// whitespace, so "¡Hola!" and "hola" compare equal.
pub fn fold(text: &str) -> String {
    let lowered: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            other => other,
        })
        .collect();

    let trimmed = lowered.trim_matches(|c: char| c.is_whitespace() || matches!(c, '¡' | '!' | '¿' | '.' | ',' | ';' | ':'));
    if trimmed == "?" {
        return trimmed.to_string();
    }
    let trimmed = trimmed.trim_end_matches('?');

    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold() {
        assert_eq!(fold("  ¡Hola!  "), "hola");
        assert_eq!(fold("Buenos   Días"), "buenos dias");
        assert_eq!(fold("Sí."), "si");
        assert_eq!(fold("¿Ayuda?"), "ayuda");
        assert_eq!(fold("?"), "?");
    }

    #[test]
    fn test_parse_selection_prefixes() {
        assert_eq!(
            Command::parse_selection("serv_tributaria"),
            Command::Service("tributaria".to_string())
        );
        assert_eq!(
            Command::parse_selection("day_2026-10-19"),
            Command::Day(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap())
        );
        assert_eq!(Command::parse_selection("slot_42"), Command::Slot(42));
        assert_eq!(
            Command::parse_selection("edit_email"),
            Command::EditField(FieldKey::Email)
        );
        assert_eq!(
            Command::parse_selection("page_next"),
            Command::Page(PageDirection::Next)
        );
        assert_eq!(Command::parse_selection("confirm_yes"), Command::Confirm);
    }

    #[test]
    fn test_malformed_selection_is_unknown() {
        assert!(matches!(Command::parse_selection("slot_abc"), Command::Unknown(_)));
        assert!(matches!(Command::parse_selection("day_19/10"), Command::Unknown(_)));
        assert!(matches!(Command::parse_selection("serv_"), Command::Unknown(_)));
        assert!(matches!(Command::parse_selection("foo_1"), Command::Unknown(_)));
    }

    #[test]
    fn test_parse_text_keywords() {
        assert_eq!(Command::parse_text("Cancelar"), Command::Cancel);
        assert_eq!(Command::parse_text("hola"), Command::Greeting);
        assert_eq!(Command::parse_text("Buenas tardes!"), Command::Greeting);
        assert_eq!(Command::parse_text("ayuda"), Command::Help);
        assert_eq!(Command::parse_text("confirmar"), Command::Confirm);
        assert_eq!(Command::parse_text("comprobante"), Command::Receipt);
        assert_eq!(
            Command::parse_text("María González"),
            Command::Text("María González".to_string())
        );
    }

    #[test]
    fn test_cancel_word_inside_sentence_is_plain_text() {
        assert!(matches!(
            Command::parse_text("quiero cancelar mi deuda tributaria"),
            Command::Text(_)
        ));
    }

    #[test]
    fn test_yes_no_helpers() {
        assert!(is_affirmative("Sí"));
        assert!(is_affirmative("ok"));
        assert!(is_negative("No"));
        assert!(!is_negative("nombre"));
        assert!(is_skip("omitir"));
    }
}
