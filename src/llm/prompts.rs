//! LLM prompts for tree generation and retrieval.

/// Collection of prompts used across indexing and retrieval.
pub struct Prompts;

impl Prompts {
    /// Prompt to detect a table of contents in the leading pages and
    /// transform it into (title, page) entries in document order.
    pub fn toc_detector() -> &'static str {
        r#"Your job is to detect whether the given text contains a table of contents and, if so, to transform it into structured entries.

The provided text contains tags like <physical_index_X> to indicate the start and end of page X.

Given text: {content}

Return the following JSON format:
{
    "thinking": <why you think there is or is not a table of contents in the given text>,
    "has_toc": <true or false>,
    "entries": [
        {
            "title": <title of the section, keep the original title>,
            "page": <page number the table of contents declares for this section, as an integer>
        },
        ...
    ]
}

List entries in the order the table of contents gives them. If has_toc is false, return an empty entries list.
Please note: abstract, summary, notation list, figure list, table list, etc. are not table of contents.
Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt to emit section starts with titles for one window of pages.
    pub fn outline_window() -> &'static str {
        r#"You are an expert in extracting document structure. Your task is to list every section that starts in the given text.

The provided text contains tags like <physical_index_X> to indicate the start and end of page X.

For the title, extract the original title from the text, only fix space inconsistency.
For the physical_index, report the page on which the section starts. Keep the <physical_index_X> format.

The response should be in the following format:
    [
        {
            "title": <title of the section, keep the original title>,
            "physical_index": "<physical_index_X> (keep the format)"
        },
        ...
    ]

Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt to assign hierarchy levels to a flat ordered outline.
    pub fn assign_levels() -> &'static str {
        r#"You are given a flat list of section titles from a document, in order of appearance, each with its start page.

Assign each entry a hierarchy level: 1 for a top-level chapter or item, 2 for a section within it, 3 for a subsection, and so on. A child entry always follows its parent in the list, and levels never skip (a level-3 entry only appears under a level-2 entry).

Outline:
{outline}

The response should be in the following format:
{
    "levels": [<level of entry 1>, <level of entry 2>, ...]
}

The levels list must have exactly one integer per outline entry, in the same order.
Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt to propose child sections for an oversized node.
    pub fn subdivide_node() -> &'static str {
        r#"You are given the full text of the section "{title}" from a document. Your task is to divide it into its natural subsections.

The provided text contains tags like <physical_index_X> to indicate the start and end of page X.

For each subsection, extract the original heading from the text, only fix space inconsistency. Report the page on which each subsection starts, keeping the <physical_index_X> format. Subsections must appear in page order and together cover the whole section.

The response should be in the following format:
    [
        {
            "title": <title of the subsection, keep the original title>,
            "physical_index": "<physical_index_X> (keep the format)"
        },
        ...
    ]

If the section has no natural subsections, return an empty list.
Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt to score how faithfully proposed children cover a parent section.
    pub fn subdivision_accuracy() -> &'static str {
        r#"A section of a document has been divided into proposed subsections. Your job is to judge how faithfully the proposed subsections cover the parent section's content.

Parent section: "{title}", pages {start}-{end}.

Proposed subsections:
{children}

Parent text (with <physical_index_X> page tags):
{content}

Score from 0.0 to 1.0: 1.0 means every subsection title is a real heading on its claimed page and the subsections cover the parent without gaps; 0.0 means the subsections are fabricated or misplaced.

Reply format:
{
    "thinking": <what you checked>,
    "score": <number between 0.0 and 1.0>
}
Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt to generate a summary for a document section.
    pub fn node_summary() -> &'static str {
        r#"You are given a section from a financial filing. Generate a concise single-paragraph summary describing the main topics and key information covered in this section.

Section Title: {title}

Section Content:
{content}

Provide ONLY the summary text, nothing else. Be specific about what information this section contains that would help someone searching for relevant content."#
    }

    /// Prompt to generate a whole-document description from root summaries.
    pub fn document_description() -> &'static str {
        r#"You are given the top-level section summaries of a financial filing, in document order. Write a short description (2-3 sentences) of what the document as a whole covers.

Section summaries:
{summaries}

Provide ONLY the description text, nothing else."#
    }

    /// Prompt to decompose a query into atomic sub-questions.
    pub fn decompose_query() -> &'static str {
        r#"Split the user's question into atomic sub-questions. Each sub-question must be answerable on its own from a single company's filing. When a sub-question is clearly about one company or one fiscal year, tag it.

User question: {query}

The response should be in the following format:
{
    "sub_questions": [
        {
            "question": <the atomic sub-question>,
            "target_company": <ticker or company name, or null>,
            "target_year": <fiscal year as an integer, or null>
        },
        ...
    ]
}

A simple question yields a single sub-question. Do not invent sub-questions the user did not ask.
Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt for tree search over the text-stripped structure.
    pub fn tree_search() -> &'static str {
        r#"You are an expert at navigating hierarchical document structures to find relevant information.

You are given:
1. A question
2. A hierarchical tree structure of a document, where each node has a node_id, a title, and a summary

Your task is to identify which nodes are most likely to contain information relevant to the question, judging by their titles and summaries.

Tree structure:
{tree}

Question: {query}

Reply in JSON format:
{
    "thinking": <your reasoning about which nodes are relevant and why>,
    "node_list": ["<node_id>", "<node_id>", ...]
}

Order node ids from most to least relevant. Only use node_id values that appear in the tree.
Directly return the final JSON structure. Do not output anything else."#
    }

    /// Prompt contract for cited answer generation.
    pub fn generate_answer() -> &'static str {
        r#"Answer the user's question using ONLY the provided context. Do not use outside knowledge.

Question: {query}

The question was decomposed into these sub-questions (0-indexed):
{sub_questions}

Context (each block is one document section):
{context}

Rules:
- For every factual claim, include an inline citation of the form [<company>, <year>, p<start>] or [<company>, <year>, p<start>-<end>] using the pages of the section the claim comes from.
- If a sub-question cannot be answered from the context, say so rather than guessing.
- If two documents contradict each other, state both figures with their citations.

After the answer, conclude with a JSON block in the following format:
```json
{
    "citations": [
        {
            "company": <company name>,
            "ticker": <ticker>,
            "fiscal_year": <year as integer>,
            "node_id": <node_id of the cited section>,
            "start_page": <first cited page as integer>,
            "end_page": <last cited page as integer>,
            "sub_question": <0-based index of the sub-question this citation answers>
        },
        ...
    ],
    "unanswerable_sub_questions": [<0-based indices of sub-questions the context could not answer>],
    "conflicts_detected": [<short description of each contradiction found, if any>]
}
```"#
    }

    /// System prompt for general document analysis.
    pub fn system_document_analyzer() -> &'static str {
        "You are an expert financial-document analyzer. You help extract structure, navigate content, and answer questions about filings. Always respond with valid JSON when requested."
    }
}
