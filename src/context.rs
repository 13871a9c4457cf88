//! System prompt construction from dashboard data.
//!
//! The data itself comes from a [`SalesDataProvider`]; nothing here depends
//! on a particular dataset.

use crate::portal::PORTAL_MARKER;
use crate::types::{ChatMessage, ChatRole};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationSales {
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Gross Sales")]
    pub gross_sales: f64,
    #[serde(rename = "Gross Profit")]
    pub gross_profit: f64,
    #[serde(rename = "Items Sold")]
    pub items_sold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductSales {
    #[serde(rename = "Product")]
    pub product: String,
    #[serde(rename = "Gross Sales")]
    pub gross_sales: f64,
    #[serde(rename = "Gross Profit")]
    pub gross_profit: f64,
    #[serde(rename = "Items Sold")]
    pub items_sold: u64,
    #[serde(rename = "Category", default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

fn margin(gross_profit: f64, gross_sales: f64) -> f64 {
    if gross_sales > 0.0 {
        gross_profit / gross_sales
    } else {
        0.0
    }
}

impl LocationSales {
    pub fn margin(&self) -> f64 {
        margin(self.gross_profit, self.gross_sales)
    }
}

impl ProductSales {
    pub fn margin(&self) -> f64 {
        margin(self.gross_profit, self.gross_sales)
    }

    fn matches(&self, query: &str) -> bool {
        query.contains(&self.product.to_lowercase())
            || self
                .category
                .as_ref()
                .is_some_and(|c| query.contains(&c.to_lowercase()))
    }
}

/// Source of the figures the assistant reasons about
pub trait SalesDataProvider: Send + Sync {
    fn locations(&self) -> Vec<LocationSales>;
    fn products(&self) -> Vec<ProductSales>;
}

/// Fixed in-memory dataset
#[derive(Debug, Clone, Default)]
pub struct StaticSalesData {
    pub locations: Vec<LocationSales>,
    pub products: Vec<ProductSales>,
}

impl StaticSalesData {
    pub fn new(locations: Vec<LocationSales>, products: Vec<ProductSales>) -> Self {
        Self {
            locations,
            products,
        }
    }

    /// Small dataset used by the demo binary
    pub fn demo() -> Self {
        let location = |name: &str, sales: f64, profit: f64, items: u64| LocationSales {
            location: name.to_string(),
            gross_sales: sales,
            gross_profit: profit,
            items_sold: items,
        };
        let product = |name: &str, sales: f64, profit: f64, items: u64, category: &str| {
            ProductSales {
                product: name.to_string(),
                gross_sales: sales,
                gross_profit: profit,
                items_sold: items,
                category: Some(category.to_string()),
            }
        };
        Self {
            locations: vec![
                location("Denver", 258_000.0, 125_000.0, 5200),
                location("Boulder", 185_000.0, 98_000.0, 3800),
                location("Fort Collins", 142_000.0, 68_000.0, 2900),
                location("Colorado Springs", 198_000.0, 88_000.0, 4100),
                location("Pueblo", 95_000.0, 52_000.0, 1950),
            ],
            products: vec![
                product("Blue Dream", 78_000.0, 42_000.0, 1850, "Flower"),
                product("Sour Diesel", 65_000.0, 35_000.0, 1540, "Flower"),
                product("Girl Scout Cookies", 55_000.0, 29_000.0, 1280, "Flower"),
                product("OG Kush", 48_000.0, 26_000.0, 1150, "Flower"),
                product("Purple Haze", 42_000.0, 22_000.0, 980, "Flower"),
                product("Northern Lights Vape", 38_000.0, 25_000.0, 650, "Vapes"),
                product("Indica Gummies", 32_000.0, 20_000.0, 2400, "Edibles"),
                product("CBD Tincture", 28_000.0, 18_000.0, 850, "Tinctures"),
            ],
        }
    }
}

impl SalesDataProvider for StaticSalesData {
    fn locations(&self) -> Vec<LocationSales> {
        self.locations.clone()
    }

    fn products(&self) -> Vec<ProductSales> {
        self.products.clone()
    }
}

fn descending(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

pub fn summarize_locations(locations: &[LocationSales]) -> String {
    let mut by_revenue = locations.to_vec();
    by_revenue.sort_by(|a, b| descending(a.gross_sales, b.gross_sales));
    let by_revenue: Vec<String> = by_revenue
        .iter()
        .take(5)
        .map(|l| {
            format!(
                "{}: ${:.0}, GP ${:.0}",
                l.location, l.gross_sales, l.gross_profit
            )
        })
        .collect();

    let mut by_margin = locations.to_vec();
    by_margin.sort_by(|a, b| descending(a.margin(), b.margin()));
    let by_margin: Vec<String> = by_margin
        .iter()
        .take(3)
        .map(|l| {
            format!(
                "{}: {:.1}% margin on ${:.0} sales",
                l.location,
                l.margin() * 100.0,
                l.gross_sales
            )
        })
        .collect();

    format!(
        "Top Stores by Revenue:\n{}\n\nTop Stores by Margin:\n{}",
        by_revenue.join("\n"),
        by_margin.join("\n")
    )
}

pub fn summarize_products(products: &[ProductSales]) -> String {
    let mut by_revenue = products.to_vec();
    by_revenue.sort_by(|a, b| descending(a.gross_sales, b.gross_sales));
    let by_revenue: Vec<String> = by_revenue
        .iter()
        .take(5)
        .map(|p| {
            format!(
                "{}: ${:.0} ({} units)",
                p.product, p.gross_sales, p.items_sold
            )
        })
        .collect();

    let mut by_margin = products.to_vec();
    by_margin.sort_by(|a, b| descending(a.margin(), b.margin()));
    let by_margin: Vec<String> = by_margin
        .iter()
        .take(3)
        .map(|p| {
            format!(
                "{}: {:.1}% margin on ${:.0} sales",
                p.product,
                p.margin() * 100.0,
                p.gross_sales
            )
        })
        .collect();

    let mut by_volume = products.to_vec();
    by_volume.sort_by(|a, b| b.items_sold.cmp(&a.items_sold));
    let by_volume: Vec<String> = by_volume
        .iter()
        .take(3)
        .map(|p| {
            let unit_price = if p.items_sold > 0 {
                p.gross_sales / p.items_sold as f64
            } else {
                0.0
            };
            format!(
                "{}: {} units at ${:.2}/unit",
                p.product, p.items_sold, unit_price
            )
        })
        .collect();

    format!(
        "Top Products by Revenue:\n{}\n\nTop Products by Margin:\n{}\n\nTop Products by Volume:\n{}",
        by_revenue.join("\n"),
        by_margin.join("\n"),
        by_volume.join("\n")
    )
}

/// What the user is mostly asking about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Chart,
    /// A picture, answered with ASCII art
    Picture,
    Profit,
    Sales,
    General,
}

impl QueryMode {
    pub fn detect(query: &str) -> Self {
        let query = query.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| query.contains(w));

        if has(&["chart", "graph", "visual", "plot", "portal"]) {
            QueryMode::Chart
        } else if has(&["picture", "image", "photo"]) {
            QueryMode::Picture
        } else if has(&["show"]) {
            QueryMode::Chart
        } else if has(&["profit", "margin"]) {
            QueryMode::Profit
        } else if has(&["sales", "revenue", "selling"]) {
            QueryMode::Sales
        } else {
            QueryMode::General
        }
    }

    fn instructions(self) -> String {
        match self {
            QueryMode::Chart => format!(
                "IMPORTANT: The user wants to see a visualization. You MUST include a \"{PORTAL_MARKER}\" \
                 marker in your response followed by visualization data in JSON format.\n\n\
                 Example response format:\n\
                 Here's the visualization of your data.\n\n\
                 {PORTAL_MARKER}\n\
                 {{\"chart_type\": \"bar\", \"labels\": [\"Store A\", \"Store B\"], \"data\": [5000, 3000], \"title\": \"Store Performance\"}}"
            ),
            QueryMode::Picture => ascii_art_instructions(),
            QueryMode::Profit => "Focus on providing profit and margin insights. Highlight the most \
                                  profitable products and stores."
                .to_string(),
            QueryMode::Sales => "Focus on providing sales and revenue insights. Highlight the \
                                 best-selling products and top-performing stores."
                .to_string(),
            QueryMode::General => format!(
                "You may generate JSON data for the Portal panel using this format:\n\
                 {PORTAL_MARKER} {{ \"chart_type\": \"bar|line|pie\", \"labels\": [...], \"data\": [...], \"title\": \"...\" }}"
            ),
        }
    }

    /// Modes whose prompt must replace the conversation's own system messages
    pub fn replaces_system(self) -> bool {
        matches!(self, QueryMode::Chart | QueryMode::Picture)
    }
}

fn ascii_art_instructions() -> String {
    format!(
        "IMPORTANT INSTRUCTION: When the user requests a picture or image, create an ASCII art \
         representation and include it in a code block. Also include a \"{PORTAL_MARKER}\" marker \
         followed by the same ASCII art in a JSON format.\n\n\
         Example response format:\n\
         Here's an ASCII art representation of a dog:\n\n\
         ```\n  / \\__\n (    @\\___\n /         O\n/   (_____/\n/_____/   U\n```\n\n\
         {PORTAL_MARKER}\n\
         {{\"type\": \"asciiArt\", \"subject\": \"dog\", \"art\": \"  / \\\\__\\n (    @\\\\___\\n /         O\\n/   (_____/\\n/_____/   U\"}}"
    )
}

/// System prompt used when no dashboard data is attached
pub fn standalone_system_prompt(mode: QueryMode) -> ChatMessage {
    let content = match mode {
        QueryMode::Picture => format!(
            "You are a helpful AI assistant that can create ASCII art representations of images.\n\n{}",
            ascii_art_instructions()
        ),
        _ => format!(
            "You are a helpful AI assistant that specializes in creating visualizations.\n\n\
             IMPORTANT INSTRUCTION: When the user requests ANY data, chart, graph, or visualization, \
             you MUST include a \"{PORTAL_MARKER}\" marker in your response followed by visualization \
             data in JSON format.\n\n\
             Example response format when visualization is requested:\n\
             Here's your explanation...\n\n\
             {PORTAL_MARKER}\n\
             {{\"type\": \"lineChart\", \"title\": \"Data Visualization\", \"data\": {{\"labels\": [\"Jan\", \"Feb\", \"Mar\"], \
             \"datasets\": [{{\"label\": \"Sales\", \"data\": [50, 60, 70], \"borderColor\": \"blue\", \"fill\": false}}]}}}}\n\n\
             For stock market data, ALWAYS include a complete JSON object with the \"{PORTAL_MARKER}\" marker."
        ),
    };
    ChatMessage::system(content)
}

pub fn wants_visualization(query: &str) -> bool {
    QueryMode::detect(query) == QueryMode::Chart
}

/// Build the system message for `query` from the provider's data.
///
/// When the query names specific stores or products, only those are
/// summarized.
pub fn build_sales_context(provider: &dyn SalesDataProvider, query: Option<&str>) -> ChatMessage {
    let mut locations = provider.locations();
    let mut products = provider.products();
    let query = query.map(str::to_lowercase);

    if let Some(query) = &query {
        let named_locations: Vec<LocationSales> = locations
            .iter()
            .filter(|l| query.contains(&l.location.to_lowercase()))
            .cloned()
            .collect();
        if !named_locations.is_empty() {
            locations = named_locations;
        }

        let named_products: Vec<ProductSales> =
            products.iter().filter(|p| p.matches(query)).cloned().collect();
        if !named_products.is_empty() {
            products = named_products;
        }
    }

    let mode = query
        .as_deref()
        .map(QueryMode::detect)
        .unwrap_or(QueryMode::General);

    ChatMessage::system(format!(
        "You are an embedded AI assistant inside a retail analytics dashboard.\n\n\
         Use the following data context for reasoning:\n\n\
         {}\n\n{}\n\n{}\n\n\
         Avoid guessing numbers. Stick to what you know from the provided data.",
        summarize_locations(&locations),
        summarize_products(&products),
        mode.instructions()
    ))
}

/// Prepend `system` unless the conversation already carries a system message.
pub fn with_system_context(messages: Vec<ChatMessage>, system: ChatMessage) -> Vec<ChatMessage> {
    if messages.iter().any(|m| m.role == ChatRole::System) {
        return messages;
    }
    let mut enhanced = Vec::with_capacity(messages.len() + 1);
    enhanced.push(system);
    enhanced.extend(messages);
    enhanced
}

/// Drop every system message and put `system` first.
pub fn replace_system_context(messages: Vec<ChatMessage>, system: ChatMessage) -> Vec<ChatMessage> {
    let mut replaced = Vec::with_capacity(messages.len() + 1);
    replaced.push(system);
    replaced.extend(messages.into_iter().filter(|m| m.role != ChatRole::System));
    replaced
}

/// Add the system prompt the latest user message calls for.
///
/// Chart and picture requests replace any system messages already present;
/// other requests only get a prompt when the conversation has none. The
/// prompt is built from `data` when given.
pub fn shape_conversation(
    messages: Vec<ChatMessage>,
    data: Option<&dyn SalesDataProvider>,
) -> Vec<ChatMessage> {
    let query = last_user_message(&messages).unwrap_or_default().to_string();
    let mode = QueryMode::detect(&query);
    let system = match data {
        Some(data) => build_sales_context(data, Some(&query)),
        None => standalone_system_prompt(mode),
    };
    if mode.replaces_system() {
        replace_system_context(messages, system)
    } else {
        with_system_context(messages, system)
    }
}

/// Text of the most recent user message, if any
pub fn last_user_message(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.as_str())
}
