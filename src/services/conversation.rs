use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::command::{
    is_affirmative, is_negative, DAY_PREFIX, EDIT_PREFIX, ID_CONFIRM_EDIT, ID_CONFIRM_NO,
    ID_CONFIRM_YES, ID_PAGE_NEXT, ID_PAGE_PREV, SERVICE_PREFIX, SLOT_PREFIX,
};
use crate::models::{
    BookingRecord, BookingStatus, Command, ConversationState, InboundEvent, PageDirection,
    Service, ServiceCatalog, Slot, Stage,
};
use crate::services::calendar::day_label;
use crate::services::form::{default_schema, FieldKey, FormInput, FormSession, FormStep};
use crate::services::messaging::{
    Choice, ChoiceSection, MessagingProvider, OutboundMessage, MAX_BUTTONS,
};
use crate::services::receipt::ReceiptGenerator;
use crate::services::sessions::SessionStore;
use crate::services::slots::SlotStore;

/// Knobs the booking flow reads; a subset of [`AppConfig`].
#[derive(Debug, Clone)]
pub struct BookingSettings {
    pub business_name: String,
    pub days_offered: usize,
    pub page_size: usize,
    pub support_contact: String,
    pub phone_country_code: String,
    pub phone_digits: usize,
}

impl BookingSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            business_name: config.business_name.clone(),
            days_offered: config.days_offered,
            page_size: config.slots_page_size,
            support_contact: config.support_contact.clone(),
            phone_country_code: config.phone_country_code.clone(),
            phone_digits: config.phone_digits,
        }
    }
}

/// What happens to the session once a handler is done.
enum Transition {
    To(Stage),
    /// Booked, declined or cancelled: the session record is removed.
    End,
}

/// The booking state machine. One call to [`handle`](Self::handle) per inbound
/// event; calls for the same address are expected to arrive one at a time.
pub struct BookingOrchestrator {
    slots: Arc<dyn SlotStore>,
    sessions: Arc<dyn SessionStore>,
    messaging: Arc<dyn MessagingProvider>,
    receipts: Arc<dyn ReceiptGenerator>,
    catalog: ServiceCatalog,
    settings: BookingSettings,
}

impl BookingOrchestrator {
    pub fn new(
        slots: Arc<dyn SlotStore>,
        sessions: Arc<dyn SessionStore>,
        messaging: Arc<dyn MessagingProvider>,
        receipts: Arc<dyn ReceiptGenerator>,
        catalog: ServiceCatalog,
        settings: BookingSettings,
    ) -> Self {
        Self {
            slots,
            sessions,
            messaging,
            receipts,
            catalog,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn slots(&self) -> &Arc<dyn SlotStore> {
        &self.slots
    }

    pub fn receipts(&self) -> &Arc<dyn ReceiptGenerator> {
        &self.receipts
    }

    pub async fn handle(&self, address: &str, event: InboundEvent) -> anyhow::Result<()> {
        let command = Command::from_event(&event);
        let mut state = self
            .sessions
            .get(address)
            .await?
            .unwrap_or_else(|| ConversationState::new(address));

        tracing::info!(
            address,
            stage = state.stage.name(),
            command = ?command,
            "processing inbound event"
        );

        // Cancellation wins over every stage; help and media never mutate state.
        match command {
            Command::Cancel => {
                self.cancel(&state).await;
                self.sessions.delete(address).await?;
                return Ok(());
            }
            Command::Help => {
                self.send(address, OutboundMessage::text(help_for(&state.stage)))
                    .await;
                return Ok(());
            }
            Command::Audio | Command::Unsupported => {
                self.send(
                    address,
                    OutboundMessage::text(
                        "🙏 Por ahora solo puedo leer mensajes de texto. Por favor escribe tu respuesta.",
                    ),
                )
                .await;
                if let Some(prompt) = self.current_prompt(&state.stage) {
                    self.send(address, prompt).await;
                }
                return Ok(());
            }
            _ => {}
        }

        let stage = std::mem::replace(&mut state.stage, Stage::Initial);
        let transition = match stage {
            Stage::Initial => self.on_initial(address, command).await,
            Stage::AwaitingServiceType => self.on_service_type(address, command).await,
            Stage::AwaitingDayChoice {
                service,
                offered_days,
            } => {
                self.on_day_choice(address, service, offered_days, command)
                    .await
            }
            Stage::AwaitingTimeChoice {
                service,
                date,
                offered_slots,
                page,
            } => {
                self.on_time_choice(address, service, date, offered_slots, page, command)
                    .await
            }
            Stage::CollectingForm { form } => {
                self.on_form_input(address, form, command, &event).await
            }
            Stage::AwaitingFinalConfirmation { form } => {
                self.on_final_confirmation(address, form, command).await
            }
        };

        match transition {
            Transition::To(stage) => {
                tracing::debug!(address, stage = stage.name(), "stage transition");
                state.stage = stage;
                state.touch();
                self.sessions.set(&state).await?;
            }
            Transition::End => {
                tracing::debug!(address, "conversation finished");
                self.sessions.delete(address).await?;
            }
        }
        Ok(())
    }

    // ── Stage handlers ──

    async fn on_initial(&self, address: &str, command: Command) -> Transition {
        match command {
            Command::Greeting | Command::Menu => {
                self.send(
                    address,
                    OutboundMessage::text(format!(
                        "¡Hola! 👋 Soy el asistente de citas de *{}*.",
                        self.settings.business_name
                    )),
                )
                .await;
                self.send(address, self.service_menu()).await;
                Transition::To(Stage::AwaitingServiceType)
            }
            Command::Receipt => {
                self.resend_receipt(address).await;
                Transition::To(Stage::Initial)
            }
            Command::Service(id) => match self.catalog.get(&id) {
                Some(service) => self.offer_days(address, service, Stage::Initial).await,
                None => self.not_understood(address).await,
            },
            Command::Text(text) => match self.catalog.match_text(&text) {
                Some(service) => self.offer_days(address, service, Stage::Initial).await,
                None => self.not_understood(address).await,
            },
            _ => self.not_understood(address).await,
        }
    }

    async fn not_understood(&self, address: &str) -> Transition {
        self.send(
            address,
            OutboundMessage::text(
                "🤔 No entendí tu mensaje. Estos son los servicios con los que puedo ayudarte:",
            ),
        )
        .await;
        self.send(address, self.service_menu()).await;
        Transition::To(Stage::Initial)
    }

    async fn on_service_type(&self, address: &str, command: Command) -> Transition {
        let picked = match &command {
            Command::Service(id) => self.catalog.get(id),
            Command::Text(text) => self.catalog.match_text(text),
            _ => None,
        };

        match picked {
            Some(service) => {
                self.offer_days(address, service, Stage::AwaitingServiceType)
                    .await
            }
            None => {
                if !matches!(command, Command::Greeting | Command::Menu) {
                    self.send(
                        address,
                        OutboundMessage::text("No reconocí ese servicio. Elige uno de la lista:"),
                    )
                    .await;
                }
                self.send(address, self.service_menu()).await;
                Transition::To(Stage::AwaitingServiceType)
            }
        }
    }

    /// Fetch the next working days and show them. On a store failure the
    /// conversation stays in `fallback`.
    async fn offer_days(&self, address: &str, service: &Service, fallback: Stage) -> Transition {
        let days = match self
            .slots
            .list_next_working_days(self.settings.days_offered)
            .await
        {
            Ok(days) => days,
            Err(e) => {
                tracing::error!(error = %e, address, "failed to list working days");
                self.report_store_failure(address, "consultar los días disponibles")
                    .await;
                return Transition::To(fallback);
            }
        };

        if days.is_empty() {
            self.send(
                address,
                OutboundMessage::text(format!(
                    "😔 No hay días de atención disponibles por ahora. Escríbenos a {}.",
                    self.settings.support_contact
                )),
            )
            .await;
            return Transition::To(fallback);
        }

        self.send(address, day_menu(&service.label, &days)).await;
        Transition::To(Stage::AwaitingDayChoice {
            service: service.id.clone(),
            offered_days: days,
        })
    }

    async fn on_day_choice(
        &self,
        address: &str,
        service: String,
        offered_days: Vec<NaiveDate>,
        command: Command,
    ) -> Transition {
        let current = Stage::AwaitingDayChoice {
            service: service.clone(),
            offered_days: offered_days.clone(),
        };

        let date = match command {
            Command::Day(date) => date,
            Command::Menu | Command::Greeting => {
                self.send(address, self.service_menu()).await;
                return Transition::To(Stage::AwaitingServiceType);
            }
            _ => {
                self.send(
                    address,
                    OutboundMessage::text("Por favor elige un día de la lista 👇"),
                )
                .await;
                self.send(address, day_menu(self.service_label(&service), &offered_days))
                    .await;
                return Transition::To(current);
            }
        };

        // The offer may be from yesterday; today's calendar decides.
        let fresh_days = match self
            .slots
            .list_next_working_days(self.settings.days_offered)
            .await
        {
            Ok(days) => days,
            Err(e) => {
                tracing::error!(error = %e, address, "failed to list working days");
                self.report_store_failure(address, "consultar los días disponibles")
                    .await;
                return Transition::To(current);
            }
        };

        if !fresh_days.contains(&date) {
            self.send(
                address,
                OutboundMessage::text("Ese día ya no está disponible. Estos son los próximos días:"),
            )
            .await;
            self.send(address, day_menu(self.service_label(&service), &fresh_days))
                .await;
            return Transition::To(Stage::AwaitingDayChoice {
                service,
                offered_days: fresh_days,
            });
        }

        let open = match self.slots.list_open_slots(date).await {
            Ok(slots) => slots,
            Err(e) => {
                tracing::error!(error = %e, address, %date, "failed to list open slots");
                self.report_store_failure(address, "consultar los horarios").await;
                return Transition::To(current);
            }
        };

        if open.is_empty() {
            self.send(
                address,
                OutboundMessage::text(format!(
                    "😔 Ya no quedan horarios libres para el {}. Elige otro día:",
                    day_label(date)
                )),
            )
            .await;
            self.send(address, day_menu(self.service_label(&service), &fresh_days))
                .await;
            return Transition::To(Stage::AwaitingDayChoice {
                service,
                offered_days: fresh_days,
            });
        }

        self.send(address, slot_page(date, &open, 0, self.settings.page_size))
            .await;
        Transition::To(Stage::AwaitingTimeChoice {
            service,
            date,
            offered_slots: open,
            page: 0,
        })
    }

    async fn on_time_choice(
        &self,
        address: &str,
        service: String,
        date: NaiveDate,
        offered_slots: Vec<Slot>,
        page: usize,
        command: Command,
    ) -> Transition {
        let page_size = self.settings.page_size;

        let picked_id = match command {
            Command::Slot(id) => id,
            // A typed "09:00" picks the matching offered slot.
            Command::Text(ref text) => {
                let typed = offered_slots
                    .iter()
                    .find(|s| s.label == text.trim())
                    .map(|s| s.id);
                if let Some(id) = typed {
                    id
                } else {
                    self.send(
                        address,
                        OutboundMessage::text("Por favor elige un horario de la lista 👇"),
                    )
                    .await;
                    self.send(address, slot_page(date, &offered_slots, page, page_size))
                        .await;
                    return Transition::To(Stage::AwaitingTimeChoice {
                        service,
                        date,
                        offered_slots,
                        page,
                    });
                }
            },
            Command::Page(direction) => {
                let page = turn_page(page, direction, offered_slots.len(), page_size);
                self.send(address, slot_page(date, &offered_slots, page, page_size))
                    .await;
                return Transition::To(Stage::AwaitingTimeChoice {
                    service,
                    date,
                    offered_slots,
                    page,
                });
            }
            Command::Menu | Command::Greeting => {
                self.send(address, self.service_menu()).await;
                return Transition::To(Stage::AwaitingServiceType);
            }
            _ => {
                self.send(address, slot_page(date, &offered_slots, page, page_size))
                    .await;
                return Transition::To(Stage::AwaitingTimeChoice {
                    service,
                    date,
                    offered_slots,
                    page,
                });
            }
        };

        // Only ids from the stored offer may reach the store.
        let Some(slot) = offered_slots.iter().find(|s| s.id == picked_id).cloned() else {
            tracing::info!(address, slot_id = picked_id, "selection outside current offer");
            self.send(
                address,
                OutboundMessage::text("Esa opción ya no está vigente. Te muestro los horarios actualizados:"),
            )
            .await;
            return self
                .refresh_slots(address, service, date, offered_slots, page)
                .await;
        };

        let label = self.service_label(&service).to_string();
        match self.slots.claim_slot(slot.id, address, &label).await {
            Ok(true) => {
                tracing::info!(address, slot_id = slot.id, "slot claimed");
                let form = FormSession::new(
                    default_schema(
                        &self.settings.phone_country_code,
                        self.settings.phone_digits,
                    ),
                    label,
                    slot.clone(),
                    address.to_string(),
                );
                self.send(
                    address,
                    OutboundMessage::text(format!(
                        "✅ Apartamos para ti el horario de las *{}* del *{}*. Ahora necesito algunos datos.",
                        slot.label,
                        day_label(slot.date)
                    )),
                )
                .await;
                if let Some(prompt) = form.current_prompt() {
                    self.send(address, prompt).await;
                }
                Transition::To(Stage::CollectingForm { form })
            }
            Ok(false) => {
                tracing::info!(address, slot_id = slot.id, "slot claim lost");
                self.send(
                    address,
                    OutboundMessage::text(
                        "😔 Lo sentimos, ese horario acaba de ser reservado por otra persona. Estos son los horarios que siguen libres:",
                    ),
                )
                .await;
                self.refresh_slots(address, service, date, offered_slots, page)
                    .await
            }
            Err(e) => {
                tracing::error!(error = %e, address, slot_id = slot.id, "slot claim failed");
                self.report_store_failure(address, "reservar ese horario").await;
                Transition::To(Stage::AwaitingTimeChoice {
                    service,
                    date,
                    offered_slots,
                    page,
                })
            }
        }
    }

    /// Replace the offer with a fresh query for the same date, back on page 0.
    async fn refresh_slots(
        &self,
        address: &str,
        service: String,
        date: NaiveDate,
        previous: Vec<Slot>,
        page: usize,
    ) -> Transition {
        let open = match self.slots.list_open_slots(date).await {
            Ok(slots) => slots,
            Err(e) => {
                tracing::error!(error = %e, address, %date, "failed to refresh open slots");
                self.report_store_failure(address, "consultar los horarios").await;
                return Transition::To(Stage::AwaitingTimeChoice {
                    service,
                    date,
                    offered_slots: previous,
                    page,
                });
            }
        };

        if open.is_empty() {
            self.send(
                address,
                OutboundMessage::text(format!(
                    "Ya no quedan horarios libres para el {}.",
                    day_label(date)
                )),
            )
            .await;
            let service = match self.catalog.get(&service) {
                Some(s) => s.clone(),
                None => {
                    self.send(address, self.service_menu()).await;
                    return Transition::To(Stage::AwaitingServiceType);
                }
            };
            return self
                .offer_days(address, &service, Stage::AwaitingServiceType)
                .await;
        }

        self.send(address, slot_page(date, &open, 0, self.settings.page_size))
            .await;
        Transition::To(Stage::AwaitingTimeChoice {
            service,
            date,
            offered_slots: open,
            page: 0,
        })
    }

    async fn on_form_input(
        &self,
        address: &str,
        mut form: FormSession,
        command: Command,
        event: &InboundEvent,
    ) -> Transition {
        // Keywords like "menu" are ordinary answers here; only the raw text counts.
        let input = match (&command, event) {
            (Command::Affirm, _) => FormInput::Affirm,
            (Command::Deny, _) => FormInput::Deny,
            (Command::Skip, _) => FormInput::Skip,
            (_, InboundEvent::Text(raw)) => FormInput::Text(raw.clone()),
            _ => {
                if let Some(prompt) = form.current_prompt() {
                    self.send(address, prompt).await;
                }
                return Transition::To(Stage::CollectingForm { form });
            }
        };

        match form.step(input) {
            FormStep::Invalid { error, prompt } => {
                self.send(address, OutboundMessage::text(format!("⚠️ {error}")))
                    .await;
                self.send(address, prompt).await;
                Transition::To(Stage::CollectingForm { form })
            }
            FormStep::Next(prompt) => {
                self.send(address, prompt).await;
                Transition::To(Stage::CollectingForm { form })
            }
            FormStep::Complete => {
                self.send(address, confirmation_prompt(&form)).await;
                Transition::To(Stage::AwaitingFinalConfirmation { form })
            }
        }
    }

    async fn on_final_confirmation(
        &self,
        address: &str,
        mut form: FormSession,
        command: Command,
    ) -> Transition {
        match command {
            Command::Confirm => self.commit(address, form).await,
            Command::Text(ref text) if is_affirmative(text) => self.commit(address, form).await,
            Command::Decline => self.decline(address, &form).await,
            Command::Text(ref text) if is_negative(text) => self.decline(address, &form).await,
            Command::Edit => {
                self.send(address, edit_menu(&form)).await;
                Transition::To(Stage::AwaitingFinalConfirmation { form })
            }
            Command::EditField(key) => match form.edit(key) {
                Some(prompt) => {
                    self.send(address, prompt).await;
                    Transition::To(Stage::CollectingForm { form })
                }
                None => {
                    self.send(address, confirmation_prompt(&form)).await;
                    Transition::To(Stage::AwaitingFinalConfirmation { form })
                }
            },
            _ => {
                self.send(
                    address,
                    OutboundMessage::text("Usa los botones para confirmar, editar o cancelar tu cita 👇"),
                )
                .await;
                self.send(address, confirmation_prompt(&form)).await;
                Transition::To(Stage::AwaitingFinalConfirmation { form })
            }
        }
    }

    async fn decline(&self, address: &str, form: &FormSession) -> Transition {
        self.release_claim(address, form.slot.id).await;
        self.send(
            address,
            OutboundMessage::text(
                "Listo, descartamos la reserva y liberamos el horario. Escribe *hola* cuando quieras empezar de nuevo.",
            ),
        )
        .await;
        Transition::End
    }

    /// Re-check everything, append to the ledger, then deliver the receipt.
    async fn commit(&self, address: &str, mut form: FormSession) -> Transition {
        if !form.service_is_valid() {
            self.release_claim(address, form.slot.id).await;
            self.send(
                address,
                OutboundMessage::text("Hubo un problema con el servicio elegido. Empecemos de nuevo:"),
            )
            .await;
            self.send(address, self.service_menu()).await;
            return Transition::To(Stage::AwaitingServiceType);
        }

        if let Err(key) = form.revalidate() {
            tracing::info!(address, field = key.as_str(), "revalidation failed at commit");
            self.send(
                address,
                OutboundMessage::text(format!(
                    "⚠️ El dato *{}* necesita corrección antes de confirmar.",
                    key.label()
                )),
            )
            .await;
            if let Some(prompt) = form.edit(key) {
                self.send(address, prompt).await;
            }
            return Transition::To(Stage::CollectingForm { form });
        }

        let record = booking_record(address, &form);
        match self.slots.append_booking(&record).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(address, slot_id = form.slot.id, "claim lost before commit");
                self.send(
                    address,
                    OutboundMessage::text(format!(
                        "😔 Lo sentimos, el horario de las *{}* ya no está apartado para ti. Estos son los horarios que siguen libres:",
                        form.slot.label
                    )),
                )
                .await;
                let service = self.service_id_for_label(&form.service);
                return self
                    .refresh_slots(address, service, form.slot.date, Vec::new(), 0)
                    .await;
            }
            Err(e) => {
                tracing::error!(error = %e, address, slot_id = form.slot.id, "failed to append booking");
                self.report_store_failure(address, "registrar tu reserva").await;
                self.send(address, confirmation_prompt(&form)).await;
                return Transition::To(Stage::AwaitingFinalConfirmation { form });
            }
        }

        tracing::info!(address, booking_id = %record.id, slot_id = record.slot_id, "booking confirmed");
        self.send(
            address,
            OutboundMessage::text(format!(
                "🎉 ¡Tu cita está confirmada!\n\nServicio: {}\nFecha: {}\nHora: {}\nCódigo: *{}*",
                record.service,
                record.date.format("%d/%m/%Y"),
                form.slot.label,
                record.code()
            )),
        )
        .await;
        self.deliver_receipt(address, &record).await;
        Transition::End
    }

    // ── Cross-cutting ──

    async fn cancel(&self, state: &ConversationState) {
        if let Some(slot_id) = state.stage.held_claim() {
            self.release_claim(&state.address, slot_id).await;
        }
        tracing::info!(address = %state.address, stage = state.stage.name(), "conversation cancelled");
        self.send(
            &state.address,
            OutboundMessage::text(
                "❌ Proceso cancelado. Escribe *hola* cuando quieras agendar una cita.",
            ),
        )
        .await;
    }

    async fn release_claim(&self, address: &str, slot_id: i64) {
        match self.slots.release_slot(slot_id, address).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(address, slot_id, "claim was no longer held"),
            Err(e) => tracing::error!(error = %e, address, slot_id, "failed to release claim"),
        }
    }

    /// Receipt problems never undo a booking; the user is told how to ask again.
    async fn deliver_receipt(&self, address: &str, record: &BookingRecord) {
        let receipt = match self.receipts.generate(record).await {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::error!(error = %e, booking_id = %record.id, "receipt generation failed");
                self.send(
                    address,
                    OutboundMessage::text(
                        "Tu cita está confirmada, pero no pudimos generar el comprobante en este momento. Escribe *comprobante* más tarde para recibirlo.",
                    ),
                )
                .await;
                return;
            }
        };

        let Some(url) = receipt.url else {
            self.send(
                address,
                OutboundMessage::text(format!(
                    "📎 Guarda tu código de reserva: *{}*",
                    record.code()
                )),
            )
            .await;
            return;
        };

        let document = OutboundMessage::Document {
            link: url.clone(),
            filename: receipt.filename,
            caption: Some(format!("📎 Comprobante de tu reserva {}", record.code())),
        };
        if let Err(e) = self.messaging.send(address, &document).await {
            tracing::warn!(error = %e, address, "document delivery failed, sending link");
            self.send(
                address,
                OutboundMessage::text(format!("📎 Descarga tu comprobante aquí: {url}")),
            )
            .await;
        }
    }

    async fn resend_receipt(&self, address: &str) {
        match self.slots.latest_booking(address).await {
            Ok(Some(record)) => self.deliver_receipt(address, &record).await,
            Ok(None) => {
                self.send(
                    address,
                    OutboundMessage::text(
                        "No encontramos reservas asociadas a este número. Escribe *hola* para agendar una cita.",
                    ),
                )
                .await
            }
            Err(e) => {
                tracing::error!(error = %e, address, "failed to load latest booking");
                self.report_store_failure(address, "buscar tu reserva").await;
            }
        }
    }

    async fn report_store_failure(&self, address: &str, action: &str) {
        self.send(
            address,
            OutboundMessage::text(format!(
                "⚠️ No pudimos {action} en este momento. Intenta de nuevo en unos minutos o contáctanos en {}.",
                self.settings.support_contact
            )),
        )
        .await;
    }

    /// Delivery failures are logged; the flow does not depend on them.
    async fn send(&self, address: &str, message: OutboundMessage) {
        if let Err(e) = self.messaging.send(address, &message).await {
            tracing::error!(error = %e, address, "failed to send message");
        }
    }

    // ── Rendering ──

    fn service_label<'a>(&'a self, id: &'a str) -> &'a str {
        self.catalog.get(id).map(|s| s.label.as_str()).unwrap_or(id)
    }

    /// Forms carry the label; stages key services by id.
    fn service_id_for_label(&self, label: &str) -> String {
        self.catalog
            .services
            .iter()
            .find(|s| s.label == label)
            .map(|s| s.id.clone())
            .unwrap_or_else(|| label.to_string())
    }

    fn service_menu(&self) -> OutboundMessage {
        let body = "¿Con qué servicio te podemos ayudar?";
        if self.catalog.services.len() <= MAX_BUTTONS {
            let buttons: Vec<(String, &str)> = self
                .catalog
                .services
                .iter()
                .map(|s| (format!("{SERVICE_PREFIX}{}", s.id), s.label.as_str()))
                .collect();
            let refs: Vec<(&str, &str)> = buttons.iter().map(|(id, t)| (id.as_str(), *t)).collect();
            return OutboundMessage::buttons(body, &refs);
        }

        let rows = self
            .catalog
            .services
            .iter()
            .map(|s| {
                let choice = Choice::new(format!("{SERVICE_PREFIX}{}", s.id), &s.label);
                match &s.description {
                    Some(d) => choice.with_description(d),
                    None => choice,
                }
            })
            .collect();
        OutboundMessage::list(
            "Servicios",
            body,
            "Ver servicios",
            vec![ChoiceSection {
                title: "Servicios".to_string(),
                rows,
            }],
        )
    }

    /// What the user should be looking at for `stage`, re-sent after
    /// unreadable input.
    fn current_prompt(&self, stage: &Stage) -> Option<OutboundMessage> {
        match stage {
            Stage::Initial => None,
            Stage::AwaitingServiceType => Some(self.service_menu()),
            Stage::AwaitingDayChoice {
                service,
                offered_days,
            } => Some(day_menu(self.service_label(service), offered_days)),
            Stage::AwaitingTimeChoice {
                date,
                offered_slots,
                page,
                ..
            } => Some(slot_page(*date, offered_slots, *page, self.settings.page_size)),
            Stage::CollectingForm { form } => form.current_prompt(),
            Stage::AwaitingFinalConfirmation { form } => Some(confirmation_prompt(form)),
        }
    }
}

fn booking_record(address: &str, form: &FormSession) -> BookingRecord {
    let value = |key| form.value(key).unwrap_or_default().to_string();
    BookingRecord {
        id: Uuid::new_v4().to_string(),
        created_at: Utc::now(),
        address: address.to_string(),
        phone: value(FieldKey::Phone),
        name: value(FieldKey::Name),
        email: value(FieldKey::Email),
        service: form.service.clone(),
        date: form.slot.date,
        time: form.slot.time,
        slot_id: form.slot.id,
        status: BookingStatus::Confirmed,
        calendar_ref: None,
    }
}

fn help_for(stage: &Stage) -> String {
    match stage {
        Stage::Initial => "ℹ️ Escribe *hola* para ver los servicios o cuéntame qué necesitas (por ejemplo \"contabilidad\"). Escribe *comprobante* para recibir el comprobante de tu última reserva.".to_string(),
        Stage::AwaitingServiceType => "ℹ️ Elige uno de los servicios de la lista. Escribe *cancelar* para salir.".to_string(),
        Stage::AwaitingDayChoice { .. } => "ℹ️ Toca *Ver días* y elige la fecha que prefieras. Escribe *menu* para cambiar de servicio o *cancelar* para salir.".to_string(),
        Stage::AwaitingTimeChoice { .. } => "ℹ️ Elige un horario de la lista. Usa *Ver más* para ver otros horarios, *menu* para cambiar de servicio o *cancelar* para salir.".to_string(),
        Stage::CollectingForm { form } => {
            let field = form
                .current_field()
                .map(|f| f.key.label())
                .unwrap_or("tus datos");
            format!("ℹ️ Te estoy pidiendo: *{field}*. Escribe *cancelar* para salir y liberar el horario.")
        }
        Stage::AwaitingFinalConfirmation { .. } => "ℹ️ Revisa el resumen y toca *Confirmar*, *Editar* o *Cancelar*.".to_string(),
    }
}

pub fn day_menu(service_label: &str, days: &[NaiveDate]) -> OutboundMessage {
    let rows = days
        .iter()
        .map(|d| {
            Choice::new(format!("{DAY_PREFIX}{}", d.format("%Y-%m-%d")), day_label(*d))
                .with_description(d.format("%d/%m/%Y").to_string())
        })
        .collect();
    OutboundMessage::list(
        "📅 Días disponibles",
        format!("Elige un día para tu cita de *{service_label}*:"),
        "Ver días",
        vec![ChoiceSection {
            title: "Próximos días".to_string(),
            rows,
        }],
    )
}

fn page_count(total: usize, page_size: usize) -> usize {
    total.div_ceil(page_size.max(1)).max(1)
}

fn turn_page(page: usize, direction: PageDirection, total: usize, page_size: usize) -> usize {
    let last = page_count(total, page_size) - 1;
    match direction {
        PageDirection::Next => (page + 1).min(last),
        PageDirection::Prev => page.saturating_sub(1).min(last),
    }
}

/// One page of `slots` plus navigation rows. `page_size` is at most eight, so
/// the two navigation rows always fit in a ten-row list.
pub fn slot_page(date: NaiveDate, slots: &[Slot], page: usize, page_size: usize) -> OutboundMessage {
    let page_size = page_size.max(1);
    let pages = page_count(slots.len(), page_size);
    let page = page.min(pages - 1);

    let rows = slots
        .iter()
        .skip(page * page_size)
        .take(page_size)
        .map(|s| Choice::new(format!("{SLOT_PREFIX}{}", s.id), &s.label))
        .collect();

    let mut sections = vec![ChoiceSection {
        title: "Horarios".to_string(),
        rows,
    }];

    let mut nav = vec![];
    if page > 0 {
        nav.push(Choice::new(ID_PAGE_PREV, "⬅️ Anteriores"));
    }
    if page + 1 < pages {
        nav.push(Choice::new(ID_PAGE_NEXT, "➡️ Ver más"));
    }
    if !nav.is_empty() {
        sections.push(ChoiceSection {
            title: "Más opciones".to_string(),
            rows: nav,
        });
    }

    let mut body = format!("🕐 Horarios libres para el *{}*", day_label(date));
    if pages > 1 {
        body.push_str(&format!(" (página {} de {})", page + 1, pages));
    }
    body.push(':');

    OutboundMessage::list("Horarios", body, "Ver horarios", sections)
}

fn confirmation_prompt(form: &FormSession) -> OutboundMessage {
    OutboundMessage::buttons(
        format!("{}\n\n¿Confirmamos tu cita?", form.summary()),
        &[
            (ID_CONFIRM_YES, "✅ Confirmar"),
            (ID_CONFIRM_EDIT, "✏️ Editar"),
            (ID_CONFIRM_NO, "❌ Cancelar"),
        ],
    )
}

fn edit_menu(form: &FormSession) -> OutboundMessage {
    let ids: Vec<(String, &str)> = form
        .schema
        .iter()
        .map(|f| (format!("{EDIT_PREFIX}{}", f.key.as_str()), f.key.label()))
        .collect();
    let body = "¿Qué dato quieres corregir?";

    if ids.len() <= MAX_BUTTONS {
        let refs: Vec<(&str, &str)> = ids.iter().map(|(id, t)| (id.as_str(), *t)).collect();
        return OutboundMessage::buttons(body, &refs);
    }

    let rows = ids.into_iter().map(|(id, t)| Choice::new(id, t)).collect();
    OutboundMessage::list(
        "Editar",
        body,
        "Ver datos",
        vec![ChoiceSection {
            title: "Datos".to_string(),
            rows,
        }],
    )
}
