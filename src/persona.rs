use std::{fs, path::Path};

use handlebars::Handlebars;
use once_cell::sync::Lazy;
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid persona catalog: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("persona prompt render error: {0}")]
    Render(#[from] handlebars::RenderError),
    #[error("persona catalog is empty")]
    EmptyCatalog,
}

const PERSONA_PROMPT: &str = "persona";

static TEMPLATES: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(true);
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_template_string(
        PERSONA_PROMPT,
        "You are {{name}}, a {{age}}-year-old {{background}}. \
{{presenting_issue}} {{communication_style}} \
You are in online text therapy seeking help. \
Respond authentically as this person would, sharing feelings and experiences naturally.",
    )
    .unwrap();
    hb
});

/// A simulated client. Read-only once handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub age: u32,
    pub background: String,
    pub presenting_issue: String,
    pub communication_style: String,
    #[serde(default)]
    pub therapeutic_needs: Vec<String>,
}

impl Persona {
    pub fn new(
        name: impl Into<String>,
        age: u32,
        background: impl Into<String>,
        presenting_issue: impl Into<String>,
        communication_style: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            age,
            background: background.into(),
            presenting_issue: presenting_issue.into(),
            communication_style: communication_style.into(),
            therapeutic_needs: Vec::new(),
        }
    }

    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.therapeutic_needs = needs.into_iter().map(Into::into).collect();
        self
    }

    /// System prompt the client simulator speaks from.
    pub fn system_prompt(&self) -> Result<String, PersonaError> {
        Ok(TEMPLATES.render(PERSONA_PROMPT, self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaCatalog {
    personas: Vec<Persona>,
}

impl PersonaCatalog {
    pub fn new(personas: Vec<Persona>) -> Result<Self, PersonaError> {
        if personas.is_empty() {
            return Err(PersonaError::EmptyCatalog);
        }
        Ok(Self { personas })
    }

    pub fn builtin() -> Self {
        Self {
            personas: BUILTIN_PERSONAS.clone(),
        }
    }

    /// Accepts either a bare list or a `personas:` mapping.
    pub fn from_yaml_str(raw: &str) -> Result<Self, PersonaError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Document {
            List(Vec<Persona>),
            Wrapped { personas: Vec<Persona> },
        }

        let personas = match serde_yaml::from_str::<Document>(raw)? {
            Document::List(personas) | Document::Wrapped { personas } => personas,
        };
        Self::new(personas)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, PersonaError> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn personas(&self) -> &[Persona] {
        &self.personas
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Persona> {
        self.personas.iter().find(|persona| persona.name == name)
    }

    /// Picks `count` distinct personas. Asking for more than the catalog
    /// holds returns the whole catalog in shuffled order.
    pub fn pick<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<Persona> {
        let count = count.min(self.personas.len());
        self.personas
            .choose_multiple(rng, count)
            .cloned()
            .collect()
    }
}

static BUILTIN_PERSONAS: Lazy<Vec<Persona>> = Lazy::new(|| {
    vec![
        Persona::new(
            "Alex",
            20,
            "college sophomore studying computer science",
            "You feel overwhelmed by academic pressure, social anxiety, and imposter syndrome.",
            "You tend to be hesitant, speak in short sentences, apologize frequently, and doubt yourself.",
        )
        .with_needs(["validation", "anxiety management", "self-compassion"]),
        Persona::new(
            "Maria",
            32,
            "first-time mother on maternity leave",
            "You're experiencing postpartum mood swings, exhaustion, and worries about being a good parent.",
            "You are warm but exhausted, sometimes tearful, and crave reassurance.",
        )
        .with_needs(["normalization", "self-care strategies", "emotional support"]),
        Persona::new(
            "Jordan",
            28,
            "software engineer at a startup",
            "You're facing severe burnout, working 70+ hours/week, and losing passion for your career.",
            "You communicate logically, want concrete strategies, and tend to intellectualize emotions.",
        )
        .with_needs(["boundary setting", "stress management", "work-life balance"]),
        Persona::new(
            "Priya",
            18,
            "high school senior",
            "You're anxious about leaving home for university and fear losing your cultural identity.",
            "You are reflective, sometimes dramatic, and switch between excitement and fear.",
        )
        .with_needs(["transition support", "identity exploration", "coping skills"]),
        Persona::new(
            "Sam",
            45,
            "military veteran",
            "You're coping with PTSD symptoms including nightmares, hypervigilance, and difficulty trusting others.",
            "You are terse, guarded, and test the therapist's understanding before opening up.",
        )
        .with_needs(["trauma processing", "safety", "gradual trust building"]),
        Persona::new(
            "Elena",
            38,
            "recent immigrant working as a nurse",
            "You feel lonely, homesick, and struggle with cultural adjustment and language barriers.",
            "English is your second language; you speak politely but sometimes struggle for words.",
        )
        .with_needs(["cultural sensitivity", "connection", "practical support"]),
        Persona::new(
            "Michael",
            67,
            "recently retired executive",
            "You're adjusting to retirement, loss of identity, purpose, and your spouse's recent cancer diagnosis.",
            "You speak slowly, ponder life's meaning, and occasionally become philosophical.",
        )
        .with_needs(["meaning-making", "grief support", "life review"]),
        Persona::new(
            "Riley",
            16,
            "non-binary teenager",
            "You're facing family conflict over your gender identity and feel unsupported at school.",
            "You use casual slang, test boundaries, and frequently check if you're being understood.",
        )
        .with_needs(["identity affirmation", "family navigation", "peer support"]),
        Persona::new(
            "Chen",
            34,
            "tech founder",
            "You're dealing with extreme stress from investor pressure, insomnia, and relationship strain.",
            "You are direct, results-oriented, and sometimes impatient with 'touchy-feely' approaches.",
        )
        .with_needs(["stress reduction", "sleep hygiene", "relationship skills"]),
        Persona::new(
            "Grace",
            52,
            "teacher who lost her spouse last year",
            "You're processing grief, alternating between numbness and intense sorrow, struggling to find meaning.",
            "You write in long, reflective paragraphs and often reference memories.",
        )
        .with_needs(["grief processing", "emotional expression", "future orientation"]),
    ]
});
