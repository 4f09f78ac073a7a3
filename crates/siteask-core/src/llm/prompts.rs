//! Prompt templates keyed by name and item type
//!
//! Prompts are looked up by walking the item type's ancestor chain, so a
//! `Recipe` ranking prompt overrides the generic `Thing` one while a
//! `Restaurant` query still picks up any `LocalBusiness` prompt.

use crate::config::{Config, PromptOverride};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

/// Root of every type chain
pub const ROOT_TYPE: &str = "Thing";

pub const DETECT_IRRELEVANT_QUERY: &str = "DetectIrrelevantQueryPrompt";
pub const PREV_QUERY_DECONTEXTUALIZER: &str = "PrevQueryDecontextualizer";
pub const DECONTEXTUALIZE_CONTEXT: &str = "DecontextualizeContextPrompt";
pub const DETECT_MEMORY_REQUEST: &str = "DetectMemoryRequestPrompt";
pub const REQUIRED_INFO: &str = "RequiredInfoPrompt";
pub const RANKING: &str = "RankingPrompt";
pub const SUMMARIZE_RESULTS: &str = "SummarizeResultsPrompt";
pub const SYNTHESIZE_FOR_GENERATE: &str = "SynthesizePromptForGenerate";
pub const DESCRIPTION_FOR_GENERATE: &str = "DescriptionPromptForGenerate";

lazy_static! {
    static ref VARIABLE: Regex = Regex::new(r"\{([A-Za-z]+\.[A-Za-z]+)\}").unwrap();
}

/// Explicit child -> parent map over schema.org-like type tags
#[derive(Debug, Clone)]
pub struct TypeHierarchy {
    parents: HashMap<String, String>,
}

impl TypeHierarchy {
    /// Hierarchy covering the item types the corpus loader knows about
    pub fn builtin() -> Self {
        let edges = [
            ("CreativeWork", ROOT_TYPE),
            ("Recipe", "CreativeWork"),
            ("Movie", "CreativeWork"),
            ("TVSeries", "CreativeWork"),
            ("ScholarlyArticle", "CreativeWork"),
            ("Article", "CreativeWork"),
            ("BlogPosting", "Article"),
            ("PodcastSeries", "CreativeWork"),
            ("PodcastEpisode", "CreativeWork"),
            ("LocalBusiness", ROOT_TYPE),
            ("FoodEstablishment", "LocalBusiness"),
            ("Restaurant", "FoodEstablishment"),
            ("RealEstateListing", ROOT_TYPE),
            ("Product", ROOT_TYPE),
            ("Event", ROOT_TYPE),
            ("Item", ROOT_TYPE),
        ];
        Self {
            parents: edges
                .iter()
                .map(|(c, p)| (c.to_string(), p.to_string()))
                .collect(),
        }
    }

    /// Add or replace child -> parent edges
    pub fn with_edges(mut self, edges: &HashMap<String, String>) -> Self {
        for (child, parent) in edges {
            self.parents.insert(child.clone(), parent.clone());
        }
        self
    }

    pub fn parent(&self, tag: &str) -> Option<&str> {
        self.parents.get(tag).map(String::as_str)
    }

    pub fn is_known(&self, tag: &str) -> bool {
        tag == ROOT_TYPE || self.parents.contains_key(tag)
    }

    /// Ordered lookup list `[tag, parent, ..., Thing]`
    pub fn ancestors(&self, tag: &str) -> Vec<String> {
        let mut chain = vec![tag.to_string()];
        let mut current = tag;
        while let Some(parent) = self.parent(current) {
            if chain.iter().any(|t| t == parent) {
                tracing::warn!("Type hierarchy cycle at {} -> {}", current, parent);
                break;
            }
            chain.push(parent.to_string());
            current = parent;
        }
        if chain.last().map(String::as_str) != Some(ROOT_TYPE) {
            chain.push(ROOT_TYPE.to_string());
        }
        chain
    }
}

impl Default for TypeHierarchy {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Variable values substituted into a template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptBindings(BTreeMap<String, String>);

impl PromptBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl Into<String>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// One prompt: text with `{scope.name}` variables plus the reply schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub name: String,
    pub item_type: String,
    pub text: String,
    /// Reply field -> description of its expected value
    pub schema: BTreeMap<String, String>,
}

impl PromptTemplate {
    pub fn new(name: &str, item_type: &str, text: &str, schema: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            item_type: item_type.to_string(),
            text: text.to_string(),
            schema: schema
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Substitute variables; unbound ones render empty
    pub fn fill(&self, bindings: &PromptBindings) -> String {
        VARIABLE
            .replace_all(&self.text, |caps: &regex::Captures| {
                let name = &caps[1];
                match bindings.get(name) {
                    Some(value) => value.to_string(),
                    None => {
                        tracing::warn!("Unbound variable {} in prompt {}", name, self.name);
                        String::new()
                    }
                }
            })
            .into_owned()
    }

    /// Variables referenced by the template text
    pub fn variables(&self) -> Vec<String> {
        VARIABLE
            .captures_iter(&self.text)
            .map(|c| c[1].to_string())
            .collect()
    }
}

/// `(prompt name, item type) -> template` with nearest-ancestor lookup
#[derive(Debug, Clone)]
pub struct PromptTable {
    hierarchy: TypeHierarchy,
    prompts: HashMap<(String, String), PromptTemplate>,
}

impl PromptTable {
    pub fn empty(hierarchy: TypeHierarchy) -> Self {
        Self {
            hierarchy,
            prompts: HashMap::new(),
        }
    }

    /// Built-in prompts over the built-in hierarchy
    pub fn builtin() -> Self {
        let mut table = Self::empty(TypeHierarchy::builtin());
        for template in builtin_prompts() {
            table.insert(template);
        }
        table
    }

    /// Built-ins plus configured type edges and prompt overrides
    pub fn from_config(config: &Config) -> Self {
        let mut table = Self::builtin();
        table.hierarchy = table.hierarchy.with_edges(&config.type_parents);
        table.apply_overrides(&config.prompts);
        table
    }

    pub fn apply_overrides(&mut self, overrides: &[PromptOverride]) {
        for o in overrides {
            tracing::debug!("Prompt override {} for {}", o.name, o.item_type);
            self.insert(PromptTemplate {
                name: o.name.clone(),
                item_type: o.item_type.clone(),
                text: o.template.clone(),
                schema: o
                    .schema
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            });
        }
    }

    pub fn insert(&mut self, template: PromptTemplate) {
        self.prompts
            .insert((template.name.clone(), template.item_type.clone()), template);
    }

    pub fn hierarchy(&self) -> &TypeHierarchy {
        &self.hierarchy
    }

    /// Nearest template for `item_type`, walking up to `Thing`
    pub fn find(&self, name: &str, item_type: &str) -> Option<&PromptTemplate> {
        self.hierarchy
            .ancestors(item_type)
            .into_iter()
            .find_map(|tag| self.prompts.get(&(name.to_string(), tag)))
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

impl Default for PromptTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_prompts() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate::new(
            DETECT_IRRELEVANT_QUERY,
            ROOT_TYPE,
            "The user is querying the site {request.site} which has information about {site.itemType}s. \
Is the site utterly irrelevant to the user's query? The issue is not whether the site has the answer \
but whether it is the wrong kind of site to even ask. The user's query is: {request.query}",
            &[
                ("site_is_irrelevant_to_query", "True or False"),
                (
                    "explanation_for_irrelevance",
                    "Explanation for why the site is irrelevant, addressed to the user",
                ),
            ],
        ),
        PromptTemplate::new(
            PREV_QUERY_DECONTEXTUALIZER,
            ROOT_TYPE,
            "The user is asking the following question: '{request.rawQuery}' in the context of \
an earlier conversation with these previous queries: {request.previousQueries}. \
Does the user's question require the previous queries to be understood? If so, rewrite \
the question so that it stands on its own, carrying over every detail it depends on.",
            &[
                ("requires_decontextualization", "True or False"),
                (
                    "decontextualized_query",
                    "The rewritten query, or the original query if no rewrite is needed",
                ),
            ],
        ),
        PromptTemplate::new(
            DECONTEXTUALIZE_CONTEXT,
            ROOT_TYPE,
            "The user is asking the following question: '{request.rawQuery}' while looking at \
the {request.itemType} described as: {request.contextDescription}. Previous queries were: \
{request.previousQueries}. Rewrite the question so that it can be understood without \
seeing that item.",
            &[
                ("requires_decontextualization", "True or False"),
                ("decontextualized_query", "The rewritten query"),
            ],
        ),
        PromptTemplate::new(
            DETECT_MEMORY_REQUEST,
            ROOT_TYPE,
            "Analyze the following statement from the user. Is the user asking you to remember \
something that should apply to future queries, such as a dietary restriction or a place \
they live? If so, what is the fact to remember? The user's statement is: {request.rawQuery}. \
Facts already remembered: {request.rememberedFacts}",
            &[
                ("is_memory_request", "True or False"),
                ("memory_request", "The fact to remember, if any"),
            ],
        ),
        PromptTemplate::new(
            REQUIRED_INFO,
            "Restaurant",
            "Answering the user's query about {site.itemType}s requires knowing where the user \
is. Does the query, or the facts already known ({request.rememberedFacts}), tell you the \
location? If not, ask the user for it. The user's query is: {request.query}",
            &[
                ("required_info_found", "True or False"),
                ("user_question", "Question to ask the user for the missing information"),
            ],
        ),
        PromptTemplate::new(
            REQUIRED_INFO,
            "RealEstateListing",
            "Answering the user's query about real estate requires knowing the city or area \
the user is interested in. Does the query, or the facts already known \
({request.rememberedFacts}), name it? If not, ask the user for it. The user's query is: \
{request.query}",
            &[
                ("required_info_found", "True or False"),
                ("user_question", "Question to ask the user for the missing information"),
            ],
        ),
        PromptTemplate::new(
            RANKING,
            ROOT_TYPE,
            "Assign a score between 0 and 100 to the following {site.itemType} based on how \
relevant it is to the user's question. Use your knowledge from other sources, about the item, \
to make a judgement. If the score is above {ranking.detailThreshold}, provide a short \
description of the item highlighting the relevance to the user's question, without mentioning \
the user's question or the score. Otherwise leave the description empty. \
The user's question is: {request.query}. The item's description is {item.description}",
            &[
                ("score", "integer between 0 and 100"),
                ("description", "short description of the item"),
            ],
        ),
        PromptTemplate::new(
            RANKING,
            "Recipe",
            "Assign a score between 0 and 100 to the following recipe based on how well it \
answers the user's question. Consider ingredients, cuisine, technique, dietary constraints \
({request.rememberedFacts}) and effort. If the score is above {ranking.detailThreshold}, \
describe the recipe in one or two sentences, emphasizing what makes it a good fit, without \
mentioning the user's question or the score. The user's question is: {request.query}. \
The recipe is {item.description}",
            &[
                ("score", "integer between 0 and 100"),
                ("description", "short description of the recipe"),
            ],
        ),
        PromptTemplate::new(
            RANKING,
            "Movie",
            "Assign a score between 0 and 100 to the following movie based on how relevant it \
is to the user's question. Consider genre, cast, director, era and tone. If the score is \
above {ranking.detailThreshold}, give a short description of the movie highlighting why it \
fits, without mentioning the user's question or the score. The user's question is: \
{request.query}. The movie is {item.description}",
            &[
                ("score", "integer between 0 and 100"),
                ("description", "short description of the movie"),
            ],
        ),
        PromptTemplate::new(
            SUMMARIZE_RESULTS,
            ROOT_TYPE,
            "Summarize the following search results in 2-3 sentences, highlighting the key \
information that answers the user's question. Use only the information in the results. \
The user's question is: {request.query}. The results are: {request.answers}",
            &[("summary", "summary of the results")],
        ),
        PromptTemplate::new(
            SYNTHESIZE_FOR_GENERATE,
            ROOT_TYPE,
            "Given the following items, synthesize an answer to the user's question. Use only \
the information in the items; do not add facts that are not present. Cite the URL of every \
item the answer relies on. The user's question is: {request.query}. The items are: \
{request.answers}",
            &[
                ("answer", "the answer to the user's question"),
                ("urls", "list of urls of the items used in the answer"),
            ],
        ),
        PromptTemplate::new(
            DESCRIPTION_FOR_GENERATE,
            ROOT_TYPE,
            "The item with the following description was used to answer the user's question. \
In one or two sentences, describe the item with respect to the question, using only \
information from the description. The user's question is: {request.query}. The item's \
description is: {item.description}",
            &[("description", "short description of the item")],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestors_of_known_type() {
        let h = TypeHierarchy::builtin();
        assert_eq!(
            h.ancestors("Restaurant"),
            vec!["Restaurant", "FoodEstablishment", "LocalBusiness", "Thing"]
        );
        assert_eq!(h.ancestors("Thing"), vec!["Thing"]);
    }

    #[test]
    fn test_ancestors_of_unknown_type() {
        let h = TypeHierarchy::builtin();
        assert_eq!(h.ancestors("Spaceship"), vec!["Spaceship", "Thing"]);
    }

    #[test]
    fn test_ancestors_break_cycles() {
        let mut edges = HashMap::new();
        edges.insert("A".to_string(), "B".to_string());
        edges.insert("B".to_string(), "A".to_string());
        let h = TypeHierarchy::builtin().with_edges(&edges);
        assert_eq!(h.ancestors("A"), vec!["A", "B", "Thing"]);
    }

    #[test]
    fn test_find_nearest_override() {
        let table = PromptTable::builtin();
        assert_eq!(table.find(RANKING, "Recipe").unwrap().item_type, "Recipe");
        assert_eq!(table.find(RANKING, "Movie").unwrap().item_type, "Movie");
        // TVSeries has no override of its own and CreativeWork has none either
        assert_eq!(table.find(RANKING, "TVSeries").unwrap().item_type, "Thing");
        assert_eq!(table.find(RANKING, "Podcast").unwrap().item_type, "Thing");
    }

    #[test]
    fn test_required_info_only_for_location_types() {
        let table = PromptTable::builtin();
        assert!(table.find(REQUIRED_INFO, "Restaurant").is_some());
        assert!(table.find(REQUIRED_INFO, "RealEstateListing").is_some());
        assert!(table.find(REQUIRED_INFO, "Recipe").is_none());
    }

    #[test]
    fn test_override_from_config() {
        let mut config = Config::default();
        config.type_parents.insert("Cocktail".into(), "Recipe".into());
        config.prompts.push(PromptOverride {
            name: RANKING.to_string(),
            item_type: "CreativeWork".to_string(),
            template: "Score {item.description}".to_string(),
            schema: [("score".to_string(), "int".to_string())].into_iter().collect(),
        });
        let table = PromptTable::from_config(&config);
        assert_eq!(table.find(RANKING, "Cocktail").unwrap().item_type, "Recipe");
        assert_eq!(
            table.find(RANKING, "TVSeries").unwrap().text,
            "Score {item.description}"
        );
    }

    #[test]
    fn test_fill_binds_and_blanks_unknown() {
        let template = PromptTemplate::new(
            "T",
            ROOT_TYPE,
            "Q: {request.query} / {request.site} / {item.description} / {\"json\": 1}",
            &[],
        );
        let bindings = PromptBindings::new()
            .set("request.query", "mango desserts")
            .set("request.site", "seriouseats");
        assert_eq!(
            template.fill(&bindings),
            "Q: mango desserts / seriouseats /  / {\"json\": 1}"
        );
        assert_eq!(
            template.variables(),
            vec!["request.query", "request.site", "item.description"]
        );
    }
}
