use minijinja::{context, Environment};

/// Phrase carried by the handoff reply. Admin views use it to spot escalated
/// conversations that predate the stored escalation flag.
pub const ESCALATION_MARKER: &str = "connect you with a human";

/// Phrase carried by every contact request, used the same way for the
/// awaiting-contact flag.
pub const CONTACT_REQUEST_MARKER: &str = "email address or phone number";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Welcome,
    ContactRequest,
    ContactReask,
    ContactAck,
    ConversingPrompt,
    EscalatedContactAck,
    Greeting,
    Services,
    Contact,
    Pricing,
    Portfolio,
    PassAlong,
    EscalationApology,
    Handoff,
}

impl ReplyKind {
    pub const ALL: [ReplyKind; 14] = [
        Self::Welcome,
        Self::ContactRequest,
        Self::ContactReask,
        Self::ContactAck,
        Self::ConversingPrompt,
        Self::EscalatedContactAck,
        Self::Greeting,
        Self::Services,
        Self::Contact,
        Self::Pricing,
        Self::Portfolio,
        Self::PassAlong,
        Self::EscalationApology,
        Self::Handoff,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::ContactRequest => "contact_request",
            Self::ContactReask => "contact_reask",
            Self::ContactAck => "contact_ack",
            Self::ConversingPrompt => "conversing_prompt",
            Self::EscalatedContactAck => "escalated_contact_ack",
            Self::Greeting => "greeting",
            Self::Services => "services",
            Self::Contact => "contact",
            Self::Pricing => "pricing",
            Self::Portfolio => "portfolio",
            Self::PassAlong => "pass_along",
            Self::EscalationApology => "escalation_apology",
            Self::Handoff => "handoff",
        }
    }

    fn template(self) -> &'static str {
        match self {
            Self::Welcome => {
                "{% if welcome %}{{ welcome }}{% else %}Hi there! 👋 I'm {{ owner }}'s assistant at {{ business }}. Thanks for stopping by.{% endif %}"
            }
            Self::ContactRequest => {
                "Before we dive in, could you share your email address or phone number? That way {{ owner }} can follow up with you personally."
            }
            Self::ContactReask => {
                "Hmm, that doesn't look quite right. Could you share a valid email address or phone number so we can get back to you?"
            }
            Self::ContactAck => "Thanks! I've saved {{ contact }} so {{ owner }} can reach you.",
            Self::ConversingPrompt => {
                "What can I help you with today? You can ask about services, pricing, or past projects."
            }
            Self::EscalatedContactAck => {
                "Thanks! {{ owner }} will personally reach out to you at {{ contact }} as soon as possible. Feel free to leave any other details here in the meantime."
            }
            Self::Greeting => "Hello! How can I help you today?",
            Self::Services => {
                "{{ business }} offers custom website design and development, SEO services, and ongoing maintenance. Is there a particular kind of project you have in mind?"
            }
            Self::Contact => {
                "You can reach {{ owner }} right here in the chat, or through the contact form on the site. We usually reply within one business day."
            }
            Self::Pricing => {
                "Every project is a little different, so pricing depends on scope. Share a few details about what you need and {{ owner }} will put together a quote."
            }
            Self::Portfolio => {
                "You can browse recent projects on the portfolio page. Let me know if you'd like to hear about something similar to what you're planning!"
            }
            Self::PassAlong => {
                "Thanks for the details! I'll pass this along to {{ owner }}, who will get back to you soon."
            }
            Self::EscalationApology => {
                "I'm sorry, I'm not sure I can answer that one properly."
            }
            Self::Handoff => {
                "Let me connect you with a human. {{ owner }} will take it from here. Could you share your email address or phone number so we can follow up?"
            }
        }
    }
}

/// Values interpolated into reply templates.
#[derive(Debug, Default, Clone)]
pub struct ReplyContext<'a> {
    pub contact: Option<&'a str>,
    pub welcome: Option<&'a str>,
}

/// The assistant's canned replies, rendered with the site's names filled in.
pub struct ReplyCatalog {
    env: Environment<'static>,
    owner: String,
    business: String,
}

impl ReplyCatalog {
    pub fn new(owner: impl Into<String>, business: impl Into<String>) -> Self {
        let mut env = Environment::new();
        for kind in ReplyKind::ALL {
            if let Err(err) = env.add_template(kind.name(), kind.template()) {
                tracing::warn!(template = kind.name(), error = %err, "reply template rejected");
            }
        }
        Self {
            env,
            owner: owner.into(),
            business: business.into(),
        }
    }

    pub fn render(&self, kind: ReplyKind, ctx: &ReplyContext<'_>) -> String {
        let rendered = self.env.get_template(kind.name()).and_then(|template| {
            template.render(context! {
                owner => self.owner.as_str(),
                business => self.business.as_str(),
                contact => ctx.contact.unwrap_or("your details"),
                welcome => ctx.welcome.map(str::trim).filter(|w| !w.is_empty()),
            })
        });
        match rendered {
            Ok(text) => text.trim().to_string(),
            Err(err) => {
                tracing::warn!(template = kind.name(), error = %err, "reply template failed to render");
                self.fallback(kind)
            }
        }
    }

    fn fallback(&self, kind: ReplyKind) -> String {
        match kind {
            ReplyKind::Handoff => format!(
                "Let me connect you with a human. Could you share your email address or phone number so {} can follow up?",
                self.owner
            ),
            ReplyKind::ContactRequest | ReplyKind::ContactReask => {
                "Could you share your email address or phone number?".to_string()
            }
            _ => format!("Thanks for your message! {} will get back to you soon.", self.owner),
        }
    }
}

impl Default for ReplyCatalog {
    fn default() -> Self {
        Self::new("Alex", "Studio")
    }
}
