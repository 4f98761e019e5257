//! Cypher statements for the GDPR knowledge graph.

/// Articles a detection type violates, with recitals, concepts and the
/// recommended handling.
pub const ARTICLES_FOR_DETECTION: &str = "\
MATCH (d:DetectionType {type: $detection_type})-[:VIOLATES]->(a:Article)
OPTIONAL MATCH (a)-[:EXPLAINED_BY]->(r:Recital)
OPTIONAL MATCH (a)-[:DEFINES]->(c:Concept)
RETURN
    a.number AS article_number,
    a.title AS title,
    a.full_text AS content,
    a.fine_tier AS fine_tier,
    d.severity AS severity,
    d.recommended_actions AS recommended_actions,
    collect(DISTINCT r.number) AS related_recitals,
    collect(DISTINCT c.name) AS related_concepts
ORDER BY a.number";

/// Full-text search over articles, used as the semantic channel of hybrid
/// retrieval when no caller-side embedding is available.
pub const FULLTEXT_SEARCH: &str = "\
CALL db.index.fulltext.queryNodes('gdpr_articles_fulltext', $query)
YIELD node, score
WHERE score > 0.3
RETURN node.title AS title, node.full_text AS content, score
ORDER BY score DESC
LIMIT $limit";

/// Vector similarity search with a caller-provided embedding.
pub const SEMANTIC_SEARCH: &str = "\
MATCH (a:Article)
WHERE a.embedding IS NOT NULL
WITH a, gds.similarity.cosine(a.embedding, $query_embedding) AS similarity
WHERE similarity > $threshold
RETURN
    a.number AS article_number,
    a.title AS title,
    a.full_text AS content,
    a.fine_tier AS fine_tier,
    similarity
ORDER BY similarity DESC
LIMIT $limit";

/// Keyword containment search over article titles and bodies.
pub const KEYWORD_SEARCH: &str = "\
MATCH (a:Article)
WHERE toLower(a.full_text) CONTAINS toLower($term)
   OR toLower(a.title) CONTAINS toLower($term)
RETURN DISTINCT a.title AS title, a.full_text AS content
LIMIT 2";

/// Fine tier and cap for an article.
pub const FINE_INFO: &str = "\
MATCH (f:Fine)-[:APPLIES_TO]->(a:Article {number: $article_number})
RETURN
    f.tier AS tier,
    f.max_amount AS max_amount,
    f.description AS description";

/// Relationship graph used for explainability in the review UI.
pub const EXPLANATION_GRAPH: &str = "\
MATCH path = (d:DetectionType {type: $detection_type})
    -[:VIOLATES]->(a:Article)
    -[:EXPLAINED_BY]->(r:Recital)
WITH d, a, collect(r) AS recitals
OPTIONAL MATCH (a)-[:DEFINES]->(c:Concept)
OPTIONAL MATCH (f:Fine)-[:APPLIES_TO]->(a)
RETURN
    d.type AS detection,
    d.severity AS severity,
    a.number AS article,
    a.title AS article_title,
    [r IN recitals | r.number] AS recitals,
    collect(c.name) AS concepts,
    f.tier AS fine_tier,
    f.max_amount AS fine_max";
