use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::command::{is_affirmative, is_negative, is_skip, ID_EMAIL_SKIP, ID_PHONE_NO, ID_PHONE_YES};
use crate::models::Slot;
use crate::services::messaging::OutboundMessage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    Name,
    Phone,
    Email,
    Notes,
}

impl FieldKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKey::Name => "name",
            FieldKey::Phone => "phone",
            FieldKey::Email => "email",
            FieldKey::Notes => "notes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "name" => Some(FieldKey::Name),
            "phone" => Some(FieldKey::Phone),
            "email" => Some(FieldKey::Email),
            "notes" => Some(FieldKey::Notes),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FieldKey::Name => "Nombre",
            FieldKey::Phone => "Teléfono",
            FieldKey::Email => "Correo",
            FieldKey::Notes => "Notas",
        }
    }
}

/// How a field is prompted, normalized and validated. Stored inside the
/// session so a form in flight keeps the rules it started with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Name,
    Phone {
        offer_autofill: bool,
        country_code: String,
        digits: usize,
    },
    Email,
    Text {
        prompt: String,
        min_chars: usize,
        max_chars: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSpec {
    pub key: FieldKey,
    pub kind: FieldKind,
    #[serde(default)]
    pub optional: bool,
}

pub struct PromptContext<'a> {
    pub address: &'a str,
    pub manual_entry: bool,
}

impl FieldSpec {
    pub fn prompt(&self, ctx: &PromptContext<'_>) -> OutboundMessage {
        match &self.kind {
            FieldKind::Name => OutboundMessage::text(
                "✍️ ¿A nombre de quién registramos la cita? Escribe tu nombre completo.",
            ),
            FieldKind::Phone { digits, .. } => match self.autofill_candidate(ctx) {
                Some(number) => OutboundMessage::buttons(
                    format!("📱 ¿Te contactamos al {number}?"),
                    &[(ID_PHONE_YES, "Sí, ese número"), (ID_PHONE_NO, "Usar otro")],
                ),
                None => OutboundMessage::text(format!(
                    "📱 Escribe tu número de celular ({digits} dígitos)."
                )),
            },
            FieldKind::Email if self.optional => OutboundMessage::buttons(
                "📧 Escribe tu correo electrónico para enviarte la confirmación, o toca *Omitir*.",
                &[(ID_EMAIL_SKIP, "Omitir")],
            ),
            FieldKind::Email => OutboundMessage::text("📧 Escribe tu correo electrónico."),
            FieldKind::Text { prompt, .. } => OutboundMessage::text(prompt.clone()),
        }
    }

    /// The sender's own number, offered for a yes/no shortcut before manual entry.
    fn autofill_candidate(&self, ctx: &PromptContext<'_>) -> Option<String> {
        match &self.kind {
            FieldKind::Phone {
                offer_autofill: true,
                ..
            } if !ctx.manual_entry => {
                let number = self.normalize(ctx.address);
                self.validate(&number).ok().map(|_| number)
            }
            _ => None,
        }
    }

    pub fn normalize(&self, raw: &str) -> String {
        match &self.kind {
            FieldKind::Name | FieldKind::Text { .. } => {
                raw.split_whitespace().collect::<Vec<_>>().join(" ")
            }
            FieldKind::Phone {
                country_code,
                digits,
                ..
            } => {
                let only_digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
                let international = country_code.len() + digits;
                match only_digits.strip_prefix(country_code.as_str()) {
                    Some(local) if only_digits.len() == international => local.to_string(),
                    _ => only_digits,
                }
            }
            FieldKind::Email => raw.trim().to_lowercase(),
        }
    }

    /// Checked against the normalized value, never the raw input.
    pub fn validate(&self, value: &str) -> Result<(), String> {
        match &self.kind {
            FieldKind::Name => validate_name(value),
            FieldKind::Phone { digits, .. } => {
                if value.len() == *digits && value.chars().all(|c| c.is_ascii_digit()) {
                    Ok(())
                } else {
                    Err(format!(
                        "El número debe tener {digits} dígitos, por ejemplo 7{}.",
                        "0".repeat(digits.saturating_sub(1))
                    ))
                }
            }
            FieldKind::Email => validate_email(value),
            FieldKind::Text {
                min_chars,
                max_chars,
                ..
            } => {
                let len = value.chars().count();
                if len < *min_chars || len > *max_chars {
                    Err(format!(
                        "Escribe entre {min_chars} y {max_chars} caracteres."
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn validate_name(value: &str) -> Result<(), String> {
    let error = || "Por favor escribe tu nombre completo, solo con letras.".to_string();
    let len = value.chars().count();
    if !(3..=80).contains(&len) {
        return Err(error());
    }
    if !value
        .chars()
        .all(|c| c.is_alphabetic() || c == ' ' || c == '\'' || c == '-' || c == '.')
    {
        return Err(error());
    }
    if value.chars().filter(|c| c.is_alphabetic()).count() < 2 {
        return Err(error());
    }
    Ok(())
}

fn validate_email(value: &str) -> Result<(), String> {
    let error = || "Ese correo no parece válido. Ejemplo: nombre@dominio.com".to_string();
    if value.contains(char::is_whitespace) {
        return Err(error());
    }
    let Some((local, domain)) = value.split_once('@') else {
        return Err(error());
    };
    if local.is_empty() || domain.contains('@') {
        return Err(error());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(error());
    }
    if labels.last().map(|tld| tld.len() < 2).unwrap_or(true) {
        return Err(error());
    }
    Ok(())
}

/// Name, phone (with autofill from the WhatsApp number) and optional email.
pub fn default_schema(country_code: &str, digits: usize) -> Vec<FieldSpec> {
    vec![
        FieldSpec {
            key: FieldKey::Name,
            kind: FieldKind::Name,
            optional: false,
        },
        FieldSpec {
            key: FieldKey::Phone,
            kind: FieldKind::Phone {
                offer_autofill: true,
                country_code: country_code.to_string(),
                digits,
            },
            optional: false,
        },
        FieldSpec {
            key: FieldKey::Email,
            kind: FieldKind::Email,
            optional: true,
        },
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormInput {
    Text(String),
    Affirm,
    Deny,
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormStep {
    /// Input rejected; the same field is asked again.
    Invalid {
        error: String,
        prompt: OutboundMessage,
    },
    Next(OutboundMessage),
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormSession {
    pub schema: Vec<FieldSpec>,
    pub field_index: usize,
    pub collected: BTreeMap<FieldKey, String>,
    pub service: String,
    pub slot: Slot,
    pub address: String,
    /// The user declined the autofilled phone number and types one instead.
    #[serde(default)]
    pub manual_entry: bool,
    /// Re-entering a single field from the summary; completion follows it.
    #[serde(default)]
    pub editing: bool,
}

impl FormSession {
    pub fn new(schema: Vec<FieldSpec>, service: String, slot: Slot, address: String) -> Self {
        Self {
            schema,
            field_index: 0,
            collected: BTreeMap::new(),
            service,
            slot,
            address,
            manual_entry: false,
            editing: false,
        }
    }

    pub fn current_field(&self) -> Option<&FieldSpec> {
        self.schema.get(self.field_index)
    }

    pub fn is_complete(&self) -> bool {
        self.field_index >= self.schema.len()
    }

    pub fn current_prompt(&self) -> Option<OutboundMessage> {
        self.current_field().map(|f| f.prompt(&self.prompt_context()))
    }

    fn prompt_context(&self) -> PromptContext<'_> {
        PromptContext {
            address: &self.address,
            manual_entry: self.manual_entry,
        }
    }

    pub fn value(&self, key: FieldKey) -> Option<&str> {
        self.collected.get(&key).map(String::as_str)
    }

    pub fn step(&mut self, input: FormInput) -> FormStep {
        let Some(field) = self.current_field().cloned() else {
            return FormStep::Complete;
        };
        let ctx = self.prompt_context();

        if let Some(candidate) = field.autofill_candidate(&ctx) {
            let answer = match &input {
                FormInput::Affirm => Some(true),
                FormInput::Deny => Some(false),
                FormInput::Text(t) if is_affirmative(t) => Some(true),
                FormInput::Text(t) if is_negative(t) => Some(false),
                _ => None,
            };
            match answer {
                Some(true) => return self.accept(field.key, candidate),
                Some(false) => {
                    self.manual_entry = true;
                    return FormStep::Next(field.prompt(&self.prompt_context()));
                }
                None => {}
            }
        }

        let raw = match input {
            FormInput::Skip => return self.skip(&field),
            FormInput::Text(t) if field.optional && is_skip(&t) => return self.skip(&field),
            FormInput::Text(t) => t,
            FormInput::Affirm | FormInput::Deny => {
                return self.reject(&field, "Por favor responde la pregunta actual.".to_string())
            }
        };

        let value = field.normalize(&raw);
        match field.validate(&value) {
            Ok(()) => self.accept(field.key, value),
            Err(error) => self.reject(&field, error),
        }
    }

    fn skip(&mut self, field: &FieldSpec) -> FormStep {
        if field.optional {
            self.accept(field.key, String::new())
        } else {
            self.reject(field, "Este dato es obligatorio.".to_string())
        }
    }

    fn reject(&self, field: &FieldSpec, error: String) -> FormStep {
        FormStep::Invalid {
            error,
            prompt: field.prompt(&self.prompt_context()),
        }
    }

    fn accept(&mut self, key: FieldKey, value: String) -> FormStep {
        self.collected.insert(key, value);
        self.manual_entry = false;

        if self.editing {
            self.editing = false;
            self.field_index = self.schema.len();
        } else {
            self.field_index += 1;
        }

        match self.current_prompt() {
            Some(prompt) => FormStep::Next(prompt),
            None => FormStep::Complete,
        }
    }

    /// Jump back to `key` and return its prompt.
    pub fn edit(&mut self, key: FieldKey) -> Option<OutboundMessage> {
        let index = self.schema.iter().position(|f| f.key == key)?;
        self.field_index = index;
        self.editing = true;
        self.manual_entry = false;
        self.current_prompt()
    }

    /// Full re-check before commit. Returns the first offending field.
    pub fn revalidate(&self) -> Result<(), FieldKey> {
        for field in &self.schema {
            match self.collected.get(&field.key).map(String::as_str) {
                None | Some("") if field.optional => {}
                None | Some("") => return Err(field.key),
                Some(value) => field.validate(value).map_err(|_| field.key)?,
            }
        }
        Ok(())
    }

    pub fn service_is_valid(&self) -> bool {
        !self.service.trim().is_empty()
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![
            "📋 *Resumen de tu cita*".to_string(),
            format!("Servicio: {}", self.service),
            format!("Fecha: {}", self.slot.date.format("%d/%m/%Y")),
            format!("Hora: {}", self.slot.label),
        ];
        for field in &self.schema {
            let value = match self.value(field.key) {
                Some(v) if !v.is_empty() => v,
                _ => "—",
            };
            lines.push(format!("{}: {}", field.key.label(), value));
        }
        lines.join("\n")
    }
}
