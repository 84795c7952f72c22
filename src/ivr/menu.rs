use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    English,
    Spanish,
}

impl Language {
    /// Key 1 selects English, key 2 Spanish
    pub fn from_key(key: char) -> Option<Self> {
        match key {
            '1' => Some(Language::English),
            '2' => Some(Language::Spanish),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Spanish => "Spanish",
        }
    }
    /// Tag handed to speech synthesizers
    pub fn locale(&self) -> &'static str {
        match self {
            Language::English => "en-US",
            Language::Spanish => "es-ES",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Spanish => "es",
        }
    }
}

/// Queue a caller is routed to from the main menu
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Department {
    Operator,
    Billing,
    Refunds,
    TechnicalSupport,
    Orders,
    Sales,
}

impl Department {
    pub const ALL: [Department; 6] = [
        Department::Operator,
        Department::Billing,
        Department::Refunds,
        Department::TechnicalSupport,
        Department::Orders,
        Department::Sales,
    ];

    pub fn from_key(key: char) -> Option<Self> {
        match key {
            '0' => Some(Department::Operator),
            '1' => Some(Department::Billing),
            '2' => Some(Department::Refunds),
            '3' => Some(Department::TechnicalSupport),
            '4' => Some(Department::Orders),
            '5' => Some(Department::Sales),
            _ => None,
        }
    }

    pub fn key(&self) -> char {
        match self {
            Department::Operator => '0',
            Department::Billing => '1',
            Department::Refunds => '2',
            Department::TechnicalSupport => '3',
            Department::Orders => '4',
            Department::Sales => '5',
        }
    }

    /// Stable tag passed to the voice agent and stored with the call
    pub fn tag(&self) -> &'static str {
        match self {
            Department::Operator => "operator",
            Department::Billing => "billing",
            Department::Refunds => "refunds",
            Department::TechnicalSupport => "technical_support",
            Department::Orders => "orders",
            Department::Sales => "sales",
        }
    }

    pub fn display_name(&self, language: Language) -> &'static str {
        match (self, language) {
            (Department::Operator, Language::English) => "an operator",
            (Department::Billing, Language::English) => "Billing",
            (Department::Refunds, Language::English) => "Refunds",
            (Department::TechnicalSupport, Language::English) => "Technical Support",
            (Department::Orders, Language::English) => "Order Status",
            (Department::Sales, Language::English) => "Sales",
            (Department::Operator, Language::Spanish) => "un operador",
            (Department::Billing, Language::Spanish) => "Facturación",
            (Department::Refunds, Language::Spanish) => "Reembolsos",
            (Department::TechnicalSupport, Language::Spanish) => "Soporte Técnico",
            (Department::Orders, Language::Spanish) => "Estado de Pedidos",
            (Department::Sales, Language::Spanish) => "Ventas",
        }
    }
}

impl fmt::Display for Department {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Pre-defined automated announcements
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prompt {
    /// Bilingual welcome and language choice
    LanguageMenu,
    MainMenu(Language),
    InvalidOption(Option<Language>),
    /// Silent caller, menu is repeated
    NoInputRetry(Option<Language>),
    /// Silent caller, call is dropped
    NoInputGoodbye(Option<Language>),
    Connecting(Department, Language),
}

impl Prompt {
    pub fn text(&self) -> String {
        match self {
            Prompt::LanguageMenu => "Thank you for calling. For English, press 1. \
                Para español, oprima 2."
                .to_string(),
            Prompt::MainMenu(language) => {
                let options: Vec<String> = ['1', '2', '3', '4', '5', '0']
                    .into_iter()
                    .filter_map(Department::from_key)
                    .map(|d| match language {
                        Language::English => {
                            format!("For {}, press {}.", d.display_name(*language), d.key())
                        }
                        Language::Spanish => {
                            format!("Para {}, oprima {}.", d.display_name(*language), d.key())
                        }
                    })
                    .collect();
                let intro = match language {
                    Language::English => "Please listen carefully as our menu options have changed.",
                    Language::Spanish => "Por favor escuche con atención, nuestras opciones han cambiado.",
                };
                format!("{} {}", intro, options.join(" "))
            }
            Prompt::InvalidOption(Some(Language::Spanish)) => {
                "Lo sentimos, esa no es una opción válida.".to_string()
            }
            Prompt::InvalidOption(_) => "Sorry, that is not a valid option.".to_string(),
            Prompt::NoInputRetry(Some(Language::Spanish)) => {
                "No recibimos su selección.".to_string()
            }
            Prompt::NoInputRetry(_) => "We didn't receive your selection.".to_string(),
            Prompt::NoInputGoodbye(Some(Language::Spanish)) => {
                "Lo sentimos, no recibimos una respuesta. Adiós.".to_string()
            }
            Prompt::NoInputGoodbye(_) => {
                "Sorry, we didn't get a response. Please call again later. Goodbye.".to_string()
            }
            Prompt::Connecting(department, Language::English) => format!(
                "Thank you. Please hold while we connect you to {}.",
                department.display_name(Language::English)
            ),
            Prompt::Connecting(department, Language::Spanish) => format!(
                "Gracias. Por favor espere mientras lo conectamos con {}.",
                department.display_name(Language::Spanish)
            ),
        }
    }

    /// Spoken language; `None` for the bilingual welcome
    pub fn language(&self) -> Option<Language> {
        match self {
            Prompt::LanguageMenu => None,
            Prompt::MainMenu(language) | Prompt::Connecting(_, language) => Some(*language),
            Prompt::InvalidOption(language)
            | Prompt::NoInputRetry(language)
            | Prompt::NoInputGoodbye(language) => Some(language.unwrap_or(Language::English)),
        }
    }

    /// File stem of the pre-recorded announcement, e.g. `main_menu_es`
    pub fn clip_name(&self) -> String {
        let code = self.language().map(|l| l.code()).unwrap_or("en");
        match self {
            Prompt::LanguageMenu => "language_menu".to_string(),
            Prompt::MainMenu(_) => format!("main_menu_{}", code),
            Prompt::InvalidOption(_) => format!("invalid_option_{}", code),
            Prompt::NoInputRetry(_) => format!("no_input_retry_{}", code),
            Prompt::NoInputGoodbye(_) => format!("no_input_goodbye_{}", code),
            Prompt::Connecting(department, _) => format!("connecting_{}_{}", department.tag(), code),
        }
    }

    /// Rough speaking time of the announcement
    pub fn estimated_duration_ms(&self, words_per_minute: u32) -> u64 {
        let words = self.text().split_whitespace().count() as u64;
        words * 60_000 / words_per_minute.max(1) as u64
    }
}
