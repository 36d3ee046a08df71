//! Intent & Complexity Analyzer
//!
//! Classifies a raw message into an intent, a complexity score, the set of
//! capabilities needed to answer it, and a 0-10 priority.
//!
//! Intent detection is ordered keyword matching over a bilingual table:
//! Hebrew patterns are checked before English ones and the first match wins.
//! An intent declared by the caller always ranks first. With exploration
//! enabled, a weighted random choice among the candidates can replace the top
//! pick; a fixed seed makes that reproducible.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::AnalyzerConfig;
use crate::conversation::{slots, ConversationState};
use crate::registry::capabilities;
use crate::types::{is_hebrew, AccountTier, Locale, Request};

/// What the traveller is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    FlightSearch,
    HotelSearch,
    FullTrip,
    ItineraryPlanning,
    BudgetAnalysis,
    BookingManagement,
    Greeting,
    GeneralInquiry,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlightSearch => "flight_search",
            Self::HotelSearch => "hotel_search",
            Self::FullTrip => "full_trip",
            Self::ItineraryPlanning => "itinerary_planning",
            Self::BudgetAnalysis => "budget_analysis",
            Self::BookingManagement => "booking_management",
            Self::Greeting => "greeting",
            Self::GeneralInquiry => "general_inquiry",
        }
    }

    /// Intents that drive the trip-planning dialogue
    pub fn is_trip(&self) -> bool {
        matches!(
            self,
            Self::FlightSearch | Self::HotelSearch | Self::FullTrip | Self::ItineraryPlanning
        )
    }

    /// Capabilities needed to answer this intent (before `conversation`)
    pub fn required_capabilities(&self) -> &'static [&'static str] {
        match self {
            Self::FlightSearch => &[capabilities::FLIGHT_SEARCH],
            Self::HotelSearch => &[capabilities::HOTEL_SEARCH],
            Self::FullTrip => &[
                capabilities::FLIGHT_SEARCH,
                capabilities::HOTEL_SEARCH,
                capabilities::ITINERARY_GENERATOR,
                capabilities::BUDGET_ANALYZER,
            ],
            Self::ItineraryPlanning => &[capabilities::ITINERARY_GENERATOR],
            Self::BudgetAnalysis => &[capabilities::BUDGET_ANALYZER],
            Self::BookingManagement => &[capabilities::BOOKING_MANAGER],
            Self::Greeting | Self::GeneralInquiry => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Low,
    Medium,
    High,
}

impl ComplexityLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=3 => Self::Low,
            4..=7 => Self::Medium,
            _ => Self::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// How an intent candidate was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Declared,
    HebrewKeyword,
    EnglishKeyword,
    Continuation,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentCandidate {
    pub intent: Intent,
    pub confidence: f64,
    pub source: IntentSource,
}

/// Trip parameters merged from declared context, message text and conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripQuery {
    pub destinations: Vec<String>,
    pub origin: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub budget: Option<f64>,
    pub currency: Option<String>,
    pub travelers: Option<u32>,
    pub multi_city: bool,
    pub flexible_dates: bool,
    pub preferences: Vec<String>,
}

impl TripQuery {
    pub fn travelers_or_default(&self) -> u32 {
        self.travelers.unwrap_or(1).max(1)
    }

    pub fn has_dates(&self) -> bool {
        self.start_date.is_some()
    }

    pub fn is_multi_destination(&self) -> bool {
        self.destinations.len() > 1 || self.multi_city
    }
}

/// Analyzer output for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub intent: Intent,
    pub confidence: f64,
    pub candidates: Vec<IntentCandidate>,
    pub complexity_score: u32,
    pub complexity: ComplexityLevel,
    /// Ordered, duplicate-free; always ends with `conversation`
    pub required_capabilities: Vec<String>,
    pub priority: u8,
    pub locale: Locale,
    pub urgent: bool,
    pub cancel: bool,
    pub query: TripQuery,
    /// Slots found in this turn, for the conversation flow
    pub slots: BTreeMap<String, String>,
}

// Checked in order; first match wins. Hebrew text has attached prefixes, so
// these are substring matches.
static HEBREW_PATTERNS: &[(Intent, &[&str])] = &[
    (Intent::BookingManagement, &["ההזמנה שלי", "שינוי הזמנה", "ביטול הזמנה"]),
    (Intent::FullTrip, &["חופשה", "טיול", "תכנן לי", "חבילת נופש"]),
    (Intent::FlightSearch, &["טיסה", "טיסות", "לטוס"]),
    (Intent::HotelSearch, &["מלון", "מלונות", "לינה", "צימר"]),
    (Intent::ItineraryPlanning, &["מסלול", "מה לעשות", "אטרקציות"]),
    (Intent::BudgetAnalysis, &["תקציב", "כמה עולה", "זול"]),
    (Intent::Greeting, &["שלום", "היי", "בוקר טוב", "ערב טוב"]),
];

// Single words match whole tokens (or their plural); phrases match substrings
static ENGLISH_PATTERNS: &[(Intent, &[&str])] = &[
    (Intent::BookingManagement, &["my booking", "my reservation", "change booking", "cancel booking"]),
    (Intent::FullTrip, &["trip", "vacation", "holiday", "getaway", "package", "plan a"]),
    (Intent::FlightSearch, &["flight", "fly", "airfare", "plane", "ticket"]),
    (Intent::HotelSearch, &["hotel", "accommodation", "stay", "hostel", "room"]),
    (Intent::ItineraryPlanning, &["itinerary", "things to do", "what to do", "attractions", "sightseeing"]),
    (Intent::BudgetAnalysis, &["budget", "cost", "cheap", "afford", "price"]),
    (Intent::Greeting, &["hello", "hi", "hey", "good morning", "good evening"]),
];

static CANCEL_PHRASES: &[&str] = &["cancel", "start over", "reset", "never mind", "ביטול", "התחל מחדש", "עזוב"];

static URGENT_WORDS: &[&str] = &["urgent", "asap", "today", "tomorrow", "immediately", "דחוף", "היום", "מחר", "מיד"];

static MULTI_CITY_PHRASES: &[&str] = &["multi-city", "multi city", "several cities", "multiple cities", "כמה ערים", "מספר ערים"];

static NON_PLACES: &[&str] = &[
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday",
    "Saturday", "Sunday", "The", "A", "My",
];

static EN_DESTINATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[Tt]o|[Ii]n|[Vv]isit(?:ing)?|[Ff]or)\s+([A-Z][a-zA-Z]+(?:\s[A-Z][a-zA-Z]+)?)").unwrap()
});

static EN_ORIGIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[Ff]rom\s+([A-Z][a-zA-Z]+(?:\s[A-Z][a-zA-Z]+)?)").unwrap());

static HE_DESTINATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:טיסה|טיסות|טיול|חופשה|לטוס|מלון)\s+(?:ל|ב)([\p{Hebrew}]{2,})").unwrap());

static ISO_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap());

static NUMERIC_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,2}/\d{1,2}(?:/\d{2,4})?)\b").unwrap());

static MONTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\b|(ינואר|פברואר|מרץ|אפריל|מאי|יוני|יולי|אוגוסט|ספטמבר|אוקטובר|נובמבר|דצמבר)").unwrap()
});

static BUDGET_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:\$|₪|€|budget(?:\s+of)?|תקציב(?:\s+של)?)\s*(\d[\d,]*(?:\.\d+)?)"#).unwrap()
});

static BUDGET_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(\d[\d,]*(?:\.\d+)?)\s*(?:\$|₪|€|usd|eur|dollars|שקל|ש"ח)"#).unwrap());

static TRAVELERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,3})\s*(?:people|persons|travelers|travellers|adults|pax|guests)\b|(\d{1,3})\s*(?:אנשים|נוסעים|מבוגרים)").unwrap()
});

/// Intent & complexity analyzer
pub struct IntentAnalyzer {
    config: AnalyzerConfig,
    rng: Mutex<StdRng>,
}

impl IntentAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let seed = config.exploration.as_ref().and_then(|e| e.seed);
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Analyze a request in the context of its conversation
    pub fn analyze(&self, request: &Request, conversation: &ConversationState) -> Analysis {
        let message = request.raw_message.as_str();
        let declared = &request.declared_context;
        let locale = Locale::detect(message);
        let lower = message.to_lowercase();

        let mut candidates = self.candidates(request, &lower, conversation);
        if candidates.is_empty() {
            candidates.push(IntentCandidate {
                intent: Intent::GeneralInquiry,
                confidence: self.config.keyword_confidence,
                source: IntentSource::Default,
            });
        }
        let chosen = self.select(&candidates);
        let intent = chosen.intent;
        let confidence = chosen.confidence;

        let (query, slots) = build_query(request, message, conversation);
        let urgent = declared.urgent || contains_any(&lower, URGENT_WORDS);

        let complexity_score = complexity_score(&query, urgent);
        let complexity = ComplexityLevel::from_score(complexity_score);

        let mut required_capabilities: Vec<String> = Vec::new();
        for cap in intent.required_capabilities() {
            if !required_capabilities.iter().any(|c| c == cap) {
                required_capabilities.push(cap.to_string());
            }
        }
        required_capabilities.push(capabilities::CONVERSATION.to_string());

        let priority = priority(
            urgent,
            declared.account_tier,
            declared.total_spend,
            declared.previous_bookings,
        );

        let cancel = is_cancel(&lower);

        debug!(
            "Analyzed {}: intent={} complexity={} ({}) priority={}",
            request.request_id,
            intent.as_str(),
            complexity.as_str(),
            complexity_score,
            priority
        );

        Analysis {
            intent,
            confidence,
            candidates,
            complexity_score,
            complexity,
            required_capabilities,
            priority,
            locale,
            urgent,
            cancel,
            query,
            slots,
        }
    }

    fn candidates(
        &self,
        request: &Request,
        lower: &str,
        conversation: &ConversationState,
    ) -> Vec<IntentCandidate> {
        let mut candidates = Vec::new();

        if let Some(intent) = request.declared_context.intent {
            candidates.push(IntentCandidate {
                intent,
                confidence: self.config.declared_confidence,
                source: IntentSource::Declared,
            });
        }

        let mut push = |intent: Intent, source: IntentSource| {
            if !candidates.iter().any(|c: &IntentCandidate| c.intent == intent) {
                candidates.push(IntentCandidate {
                    intent,
                    confidence: self.config.keyword_confidence,
                    source,
                });
            }
        };

        if lower.chars().any(is_hebrew) {
            for (intent, keywords) in HEBREW_PATTERNS {
                if keywords.iter().any(|kw| lower.contains(kw)) {
                    push(*intent, IntentSource::HebrewKeyword);
                }
            }
        }

        let tokens = tokenize(lower);
        for (intent, keywords) in ENGLISH_PATTERNS {
            if keywords.iter().any(|kw| matches_english(kw, lower, &tokens)) {
                push(*intent, IntentSource::EnglishKeyword);
            }
        }

        // Mid-dialogue replies ("Tokyo", "in March") continue the trip flow
        if conversation.current_state.pending_slot().is_some() {
            push(Intent::FullTrip, IntentSource::Continuation);
        }

        candidates
    }

    fn select<'a>(&self, candidates: &'a [IntentCandidate]) -> &'a IntentCandidate {
        let top = &candidates[0];
        let Some(exploration) = &self.config.exploration else {
            return top;
        };
        if candidates.len() < 2 {
            return top;
        }

        let mut rng = self.rng.lock();
        if rng.gen::<f64>() >= exploration.rate {
            return top;
        }

        let weights: Vec<f64> = candidates.iter().map(|c| c.confidence.max(0.0)).collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => {
                let picked = &candidates[dist.sample(&mut *rng)];
                debug!("Exploration picked intent {}", picked.intent.as_str());
                picked
            }
            Err(_) => top,
        }
    }
}

impl Default for IntentAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}

/// Additive rubric: +2 multi-destination, +3 multi-city, +1 more than 4
/// travellers, +2 groups of 10 or more, +2 urgent
pub fn complexity_score(query: &TripQuery, urgent: bool) -> u32 {
    let mut score = 0;
    if query.is_multi_destination() {
        score += 2;
    }
    if query.multi_city {
        score += 3;
    }
    let travelers = query.travelers_or_default();
    if travelers > 4 {
        score += 1;
    }
    if travelers >= 10 {
        score += 2;
    }
    if urgent {
        score += 2;
    }
    score
}

/// Bounded weighted sum of urgency, tier, spend and loyalty
pub fn priority(urgent: bool, tier: AccountTier, total_spend: f64, previous_bookings: u32) -> u8 {
    let mut score: u32 = 1;
    if urgent {
        score += 3;
    }
    score += match tier {
        AccountTier::Standard => 0,
        AccountTier::Premium => 2,
        AccountTier::Vip => 4,
    };
    if total_spend > 10_000.0 {
        score += 2;
    } else if total_spend > 2_000.0 {
        score += 1;
    }
    if previous_bookings > 0 {
        score += 1;
    }
    score.min(10) as u8
}

fn build_query(
    request: &Request,
    message: &str,
    conversation: &ConversationState,
) -> (TripQuery, BTreeMap<String, String>) {
    let declared = &request.declared_context;
    let collected = &conversation.collected_data;
    let lower = message.to_lowercase();
    let mut slots = BTreeMap::new();

    let mut destinations = declared.destinations.clone();
    if destinations.is_empty() {
        destinations = extract_destinations(message);
    }
    if destinations.is_empty() {
        // A bare reply to "where to?" is the destination
        if conversation.current_state.pending_slot() == Some(slots::DESTINATION) {
            let reply = message.trim().trim_end_matches(['.', '!', '?']);
            if !reply.is_empty() && reply.split_whitespace().count() <= 3 {
                destinations.push(reply.to_string());
            }
        }
    }
    if !destinations.is_empty() {
        slots.insert(slots::DESTINATION.to_string(), destinations.join(", "));
    } else if let Some(known) = collected.get(slots::DESTINATION) {
        destinations = known.split(", ").map(str::to_string).collect();
    }

    let origin = declared
        .origin
        .clone()
        .or_else(|| capture(&EN_ORIGIN, message))
        .or_else(|| collected.get(slots::ORIGIN).cloned());
    if let Some(origin) = &origin {
        slots.insert(slots::ORIGIN.to_string(), origin.clone());
    }

    let (mut start_date, mut end_date) = (declared.start_date.clone(), declared.end_date.clone());
    if start_date.is_none() {
        let mut dates = ISO_DATE
            .captures_iter(message)
            .chain(NUMERIC_DATE.captures_iter(message))
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()));
        start_date = dates.next();
        end_date = end_date.or_else(|| dates.next());
    }
    if start_date.is_none() {
        start_date = MONTH
            .captures(message)
            .and_then(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().to_string());
    }
    if let Some(start) = &start_date {
        let dates = match &end_date {
            Some(end) => format!("{}..{}", start, end),
            None => start.clone(),
        };
        slots.insert(slots::DATES.to_string(), dates);
    } else if let Some(known) = collected.get(slots::DATES) {
        let mut parts = known.splitn(2, "..");
        start_date = parts.next().map(str::to_string);
        end_date = parts.next().map(str::to_string);
    }

    let budget = declared
        .budget
        .or_else(|| extract_budget(message))
        .or_else(|| collected.get(slots::BUDGET).and_then(|b| b.parse().ok()));
    if let Some(budget) = budget {
        slots.insert(slots::BUDGET.to_string(), format_amount(budget));
    }

    let travelers = declared
        .travelers
        .or_else(|| {
            TRAVELERS
                .captures(message)
                .and_then(|c| c.get(1).or_else(|| c.get(2)))
                .and_then(|m| m.as_str().parse().ok())
        })
        .or_else(|| collected.get(slots::TRAVELERS).and_then(|t| t.parse().ok()));
    if let Some(travelers) = travelers {
        slots.insert(slots::TRAVELERS.to_string(), travelers.to_string());
    }

    let mut preferences = declared.preferences.clone();
    if preferences.is_empty() {
        if let Some(known) = collected.get(slots::PREFERENCES) {
            preferences.push(known.clone());
        }
    } else {
        slots.insert(slots::PREFERENCES.to_string(), preferences.join(", "));
    }

    let multi_city = declared.multi_city || contains_any(&lower, MULTI_CITY_PHRASES);

    let query = TripQuery {
        destinations,
        origin,
        start_date,
        end_date,
        budget,
        currency: declared.currency.clone(),
        travelers,
        multi_city,
        flexible_dates: declared.flexible_dates,
        preferences,
    };
    (query, slots)
}

fn extract_destinations(message: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let english = EN_DESTINATION
        .captures_iter(message)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()));
    let hebrew = HE_DESTINATION
        .captures_iter(message)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()));

    for place in english.chain(hebrew) {
        let first_word = place.split_whitespace().next().unwrap_or_default();
        if NON_PLACES.contains(&first_word) {
            continue;
        }
        if !found.contains(&place) {
            found.push(place);
        }
    }
    found
}

fn extract_budget(message: &str) -> Option<f64> {
    capture(&BUDGET_PREFIX, message)
        .or_else(|| capture(&BUDGET_SUFFIX, message))
        .and_then(|raw| raw.replace(',', "").parse().ok())
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 {
        format!("{}", amount as i64)
    } else {
        format!("{:.2}", amount)
    }
}

fn tokenize(lower: &str) -> Vec<&str> {
    lower
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|t| !t.is_empty())
        .collect()
}

fn matches_english(keyword: &str, lower: &str, tokens: &[&str]) -> bool {
    if keyword.contains(' ') {
        return lower.contains(keyword);
    }
    tokens
        .iter()
        .any(|t| *t == keyword || t.strip_suffix('s') == Some(keyword))
}

fn contains_any(lower: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| lower.contains(p))
}

fn is_cancel(lower: &str) -> bool {
    let trimmed = lower.trim().trim_end_matches(['.', '!']);
    CANCEL_PHRASES.contains(&trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExplorationConfig;
    use crate::conversation::FlowState;
    use crate::types::DeclaredContext;

    fn conversation() -> ConversationState {
        ConversationState::new("c1", "u1", 20)
    }

    fn analyze(message: &str) -> Analysis {
        IntentAnalyzer::default().analyze(&Request::new("u1", "c1", message), &conversation())
    }

    #[test]
    fn test_english_intents() {
        assert_eq!(analyze("Find me flights to Paris").intent, Intent::FlightSearch);
        assert_eq!(analyze("I need a hotel in Rome").intent, Intent::HotelSearch);
        assert_eq!(analyze("Plan a trip to Japan with flights").intent, Intent::FullTrip);
        assert_eq!(analyze("hello there").intent, Intent::Greeting);
        assert_eq!(analyze("What is the visa policy?").intent, Intent::GeneralInquiry);
    }

    #[test]
    fn test_hebrew_checked_before_english() {
        // "hotel" in English, but the Hebrew flight keyword wins
        let analysis = analyze("אני צריך טיסה לטוקיו, hotel later");
        assert_eq!(analysis.intent, Intent::FlightSearch);
        assert_eq!(analysis.locale, Locale::He);
        assert_eq!(analysis.candidates[0].source, IntentSource::HebrewKeyword);
    }

    #[test]
    fn test_whole_word_matching() {
        // "this" must not match greeting "hi", "stays" matches "stay"
        assert_eq!(analyze("Is this allowed?").intent, Intent::GeneralInquiry);
        assert_eq!(analyze("Cheap stays for the weekend").intent, Intent::HotelSearch);
    }

    #[test]
    fn test_declared_intent_wins() {
        let request = Request::new("u1", "c1", "hotel please").with_context(DeclaredContext {
            intent: Some(Intent::FullTrip),
            ..Default::default()
        });
        let analysis = IntentAnalyzer::default().analyze(&request, &conversation());
        assert_eq!(analysis.intent, Intent::FullTrip);
        assert_eq!(analysis.confidence, 0.8);
    }

    #[test]
    fn test_required_capabilities_always_include_conversation() {
        let analysis = analyze("Plan a vacation");
        assert_eq!(
            analysis.required_capabilities,
            vec![
                "flight_search",
                "hotel_search",
                "itinerary_generator",
                "budget_analyzer",
                "conversation"
            ]
        );
        assert_eq!(analyze("hi").required_capabilities, vec!["conversation"]);
    }

    #[test]
    fn test_complexity_rubric() {
        let simple = TripQuery {
            destinations: vec!["Tokyo".into()],
            ..Default::default()
        };
        assert_eq!(complexity_score(&simple, false), 0);
        assert_eq!(ComplexityLevel::from_score(0), ComplexityLevel::Low);

        let group = TripQuery {
            destinations: vec!["Tokyo".into()],
            travelers: Some(12),
            multi_city: true,
            ..Default::default()
        };
        assert_eq!(complexity_score(&group, false), 8);
        assert_eq!(ComplexityLevel::from_score(8), ComplexityLevel::High);

        let two_cities = TripQuery {
            destinations: vec!["Rome".into(), "Paris".into()],
            travelers: Some(5),
            ..Default::default()
        };
        assert_eq!(complexity_score(&two_cities, true), 5);
        assert_eq!(ComplexityLevel::from_score(5), ComplexityLevel::Medium);
    }

    #[test]
    fn test_priority_bounded() {
        assert_eq!(priority(false, AccountTier::Standard, 0.0, 0), 1);
        assert_eq!(priority(true, AccountTier::Vip, 50_000.0, 4), 10);
        assert_eq!(priority(false, AccountTier::Premium, 3_000.0, 1), 5);
    }

    #[test]
    fn test_slot_extraction() {
        let analysis = analyze("Trip to Barcelona from London on 2026-11-03, budget of $1,500 for 2 people");
        assert_eq!(analysis.query.destinations, vec!["Barcelona"]);
        assert_eq!(analysis.query.origin.as_deref(), Some("London"));
        assert_eq!(analysis.query.start_date.as_deref(), Some("2026-11-03"));
        assert_eq!(analysis.query.budget, Some(1500.0));
        assert_eq!(analysis.query.travelers, Some(2));
        assert_eq!(analysis.slots.get("budget").map(String::as_str), Some("1500"));
    }

    #[test]
    fn test_months_are_not_destinations() {
        let analysis = analyze("A trip in November to Lisbon");
        assert_eq!(analysis.query.destinations, vec!["Lisbon"]);
        assert_eq!(analysis.query.start_date.as_deref(), Some("November"));
    }

    #[test]
    fn test_pending_slot_reply_continues_flow() {
        let mut state = conversation();
        state.current_state = FlowState::CollectingDestination;

        let analysis = IntentAnalyzer::default().analyze(&Request::new("u1", "c1", "Kyoto"), &state);
        assert_eq!(analysis.intent, Intent::FullTrip);
        assert_eq!(analysis.query.destinations, vec!["Kyoto"]);
    }

    #[test]
    fn test_collected_slots_fill_query() {
        let mut state = conversation();
        state
            .collected_data
            .insert(slots::DESTINATION.to_string(), "Tokyo, Osaka".to_string());
        state.collected_data.insert(slots::BUDGET.to_string(), "3000".to_string());

        let analysis = IntentAnalyzer::default().analyze(&Request::new("u1", "c1", "flights please"), &state);
        assert_eq!(analysis.query.destinations, vec!["Tokyo", "Osaka"]);
        assert_eq!(analysis.query.budget, Some(3000.0));
        assert!(analysis.slots.get("destination").is_none());
    }

    #[test]
    fn test_cancel_detection() {
        assert!(analyze("cancel").cancel);
        assert!(analyze("ביטול").cancel);
        assert!(!analyze("cancel booking for tomorrow").cancel);
    }

    #[test]
    fn test_deterministic_without_exploration() {
        let analyzer = IntentAnalyzer::default();
        let request = Request::new("u1", "c1", "cheap flight and hotel");
        let first = analyzer.analyze(&request, &conversation()).intent;
        for _ in 0..20 {
            assert_eq!(analyzer.analyze(&request, &conversation()).intent, first);
        }
    }

    #[test]
    fn test_exploration_reproducible_with_seed() {
        let config = AnalyzerConfig {
            exploration: Some(ExplorationConfig {
                rate: 1.0,
                seed: Some(42),
            }),
            ..Default::default()
        };
        let request = Request::new("u1", "c1", "cheap flight and hotel");

        let run = || {
            let analyzer = IntentAnalyzer::new(config.clone());
            (0..10)
                .map(|_| analyzer.analyze(&request, &conversation()).intent)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
