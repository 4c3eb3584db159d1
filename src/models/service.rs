use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::command::fold;

/// Score awarded when the full service label appears in the message.
const LABEL_WEIGHT: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alias {
    pub text: String,
    #[serde(default = "default_alias_weight")]
    pub weight: u32,
}

fn default_alias_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<Alias>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCatalog {
    pub services: Vec<Service>,
}

impl ServiceCatalog {
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let catalog: ServiceCatalog =
            serde_json::from_str(s).context("invalid service catalog JSON")?;
        anyhow::ensure!(!catalog.services.is_empty(), "service catalog is empty");
        anyhow::ensure!(
            catalog.services.len() <= 10,
            "service catalog has more than 10 entries"
        );
        for service in &catalog.services {
            anyhow::ensure!(
                !service.id.is_empty() && !service.id.contains(char::is_whitespace),
                "service id must be a non-empty token: {:?}",
                service.id
            );
        }
        Ok(catalog)
    }

    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read service catalog: {p}"))?;
                Self::from_json(&raw)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    /// Substring match against labels and weighted aliases. The highest score
    /// wins; on a tie the entry listed first wins.
    pub fn match_text(&self, text: &str) -> Option<&Service> {
        let needle = fold(text);
        if needle.is_empty() {
            return None;
        }

        let mut best: Option<(&Service, u32)> = None;
        for service in &self.services {
            let score = score(service, &needle);
            if score == 0 {
                continue;
            }
            match best {
                Some((_, top)) if top >= score => {}
                _ => best = Some((service, score)),
            }
        }
        best.map(|(s, _)| s)
    }
}

fn score(service: &Service, needle: &str) -> u32 {
    let mut total = 0;
    if needle.contains(&fold(&service.label)) {
        total += LABEL_WEIGHT;
    }
    for alias in &service.aliases {
        let alias_text = fold(&alias.text);
        if !alias_text.is_empty() && needle.contains(&alias_text) {
            total += alias.weight;
        }
    }
    total
}

impl Default for ServiceCatalog {
    fn default() -> Self {
        let alias = |text: &str, weight: u32| Alias {
            text: text.to_string(),
            weight,
        };
        Self {
            services: vec![
                Service {
                    id: "tributaria".to_string(),
                    label: "Asesoría Tributaria".to_string(),
                    description: Some("Impuestos, declaraciones y NIT".to_string()),
                    aliases: vec![
                        alias("tributari", 3),
                        alias("impuesto", 3),
                        alias("declaracion", 2),
                        alias("nit", 2),
                        alias("iva", 2),
                    ],
                },
                Service {
                    id: "contable".to_string(),
                    label: "Contabilidad".to_string(),
                    description: Some("Estados financieros y libros".to_string()),
                    aliases: vec![
                        alias("contab", 3),
                        alias("balance", 2),
                        alias("estados financieros", 3),
                        alias("libros", 1),
                    ],
                },
                Service {
                    id: "laboral".to_string(),
                    label: "Trámites Laborales".to_string(),
                    description: Some("Planillas, finiquitos y AFP".to_string()),
                    aliases: vec![
                        alias("laboral", 3),
                        alias("planilla", 3),
                        alias("finiquito", 3),
                        alias("afp", 2),
                    ],
                },
            ],
        }
    }
}
