//! Prompt text for SQL synthesis
//!
//! The instruction prompt and the question wrapper were tuned empirically;
//! their wording, whitespace and ordering are reproduced exactly.

/// Instruction prompt; `{tablename}` is replaced with the resolved table.
pub const INSTRUCTION_TEMPLATE: &str = r#"Given an input question, construct a syntactically correct SQL query to run, then look at the results of the query and return a comprehensive and detailed answer. Ensure that you:
                - Select only the relevant columns needed to answer the question.
                - Use correct column and table names as provided in the schema description. Avoid querying for columns that do not exist.
                - Qualify column names with the table name when necessary, especially when performing joins.
                - Use aggregate functions appropriately and include performance optimizations such as WHERE clauses and indices.
                - Add additional related information for the user.
                - Use background & definitions provided for more detailed answer. Follow the instructions.
                - Your are provided with several tables each for a different proram area, ensure you retrive the relevant table.
                - do not hallucinate column names. If you can't  find a column name, do not write the sql query say I'm not sure.

                Special Instructions:
                - Default to using averages for aggregation if not specified by the user question.
                - If the requested date range is not available in the database, inform the user that data is not available for that time period.
                - Use bold and large fonts to highlight keywords in your answer.
                - If the date is not available, your answer will be: Data is not available for the requested date range. Please modify your query to include a valid date range.
                - Calculate date ranges dynamically based on the current date or specific dates mentioned in user queries. Use relative time expressions such as "last month" or "past year".
                - If a query fails to execute, suggest debugging tips or provide alternative queries. Ensure to handle common SQL errors gracefully."
                - If the query is ambiguous, generate a clarifying question to better understand the user's intent or request additional necessary parameters.
                - Users may ask about positive tests and positivity rates. Positive tests are those where finalhivtestresult is positive.
                - Negative tests are those where either test1_result OR confirmatory_result are No 
                - If a user asks about positivity rate (or similar), calculate it as the number of positive tests divided by the total number of tests for the specified group
                - If a user asks about the percentage of something (for example, percentage of positive tests) calculate it as the number of patients for which that attribute is true divided by the total number of patients

                Additional Instructions:
                            
                Please confirm the variables names in the schema before generating a query

                You are required to use the following format, each taking one line:
                Question: Question here
                SQLQuery: SQL Query to run
            
                            
                The text-to-SQL system that might be required to handle queries related to calculating proportions within a dataset. Your system should be able to generate SQL queries to calculate the proportion of a certain category within a dataset table.

                hints only gives you the columns, please use the hint to calculate proportions.  When the input question requests information that includes multiple answers (for example, asking about states with the highest rates, greatest number of positives, etc.) by default, you should arrange those answers from highest to lowest unless otherwise told in the question.
                
                Example 1 :
                If a user asks, "In what states were the positivity rates highest excluding states with a rate of 100%?", your system should generate a SQL query like:

                'SELECT stateofresidence, COUNT(*) AS TotalTests, SUM(CASE WHEN finalhivtestresult = "Positive" THEN 1 ELSE 0 END) AS TotalPositives, SUM(CASE WHEN finalhivtestresult = "Positive" THEN 1 ELSE 0 END) * 100.0 / COUNT(*) AS PositivityRate FROM {tablename} GROUP BY stateofresidence HAVING PositivityRate < 100 ORDER BY PositivityRate DESC;' 
                
                Example 2:
                If a user asks, "What is the proportion of clients offered Prep who accepted Prep", your system should generate a SQL query like:

                SELECT SUM(CASE WHEN prep_offered = 'Yes' THEN 1 ELSE 0 END) AS TotalOfferedPrep, SUM(CASE WHEN prep_offered = 'Yes' AND prep_accepted = 'Yes' THEN 1 ELSE 0 END) AS TotalAcceptedPrep, SUM(CASE WHEN prep_offered = 'Yes' AND prepaccepted = 'Yes' THEN 1 ELSE 0 END) * 100.0 / SUM(CASE WHEN prepoffered = 'Yes' THEN 1 ELSE 0 END) AS ProportionAcceptedPrep FROM {tablename};
            "#;

/// Text-to-SQL template wrapped around the composed question
pub const TEXT_TO_SQL_TEMPLATE: &str = "Given an input question, first create a syntactically correct {dialect} query to run, then look at the results of the query and return the answer. You can order the results by a relevant column to return the most interesting examples in the database.\n\nNever query for all the columns from a specific table, only ask for a few relevant columns given the question.\n\nPay attention to use only the column names that you can see in the schema description. Be careful to not query for columns that do not exist. Pay attention to which column is in which table. Also, qualify column names with the table name when needed. You are required to use the following format, each taking one line:\n\nQuestion: Question here\nSQLQuery: SQL Query to run\nSQLResult: Result of the SQLQuery\nAnswer: Final answer here\n\nOnly use tables listed below.\n{schema}\n\nQuestion: {query_str}\nSQLQuery: ";

/// Stop sequence so the model does not invent query results
pub const STOP_SEQUENCE: &str = "\nSQLResult:";

pub const SQL_DIALECT: &str = "postgresql";

pub fn instruction_prompt(table: &str) -> String {
    INSTRUCTION_TEMPLATE.replace("{tablename}", table)
}

/// Wrap a user question with the instruction prompt.
pub fn question_prompt(question: &str, instructions: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Please calculate proportion when asked to, generate sql query that contains both the numbers and proportion. Only output sql query, do not attempt to generate an answer",
    );
    prompt.push_str("You can refer to ");
    prompt.push_str(instructions);
    prompt.push_str(" for examples and instructions on how to generate a SQL statement.");
    prompt.push_str("Write a SQL query to answer the following question: ");
    prompt.push_str(question);
    prompt.push('.');
    prompt.push_str(
        "Please take note of the column names which are in quotes and their description. It is essential that you consider the data dictionary and explanations of the variables",
    );
    prompt.push_str(
        "before crafting the query. Match the question to columns in the data and pay special attention to the description of that column in the schema.",
    );
    prompt.push_str("Skip all operations/groupings that require dividing by zero.");
    prompt
}

/// Schema block: column listing plus the table description.
pub fn table_schema(table_info: &str, context: &str) -> String {
    if context.is_empty() {
        table_info.to_string()
    } else {
        format!("{} The table description is: {}", table_info, context)
    }
}

pub fn text_to_sql_prompt(schema: &str, question_prompt: &str) -> String {
    TEXT_TO_SQL_TEMPLATE
        .replace("{dialect}", SQL_DIALECT)
        .replace("{schema}", schema)
        .replace("{query_str}", question_prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "expanded_hts_weekly_2024w32";

    #[test]
    fn test_tablename_substituted_everywhere() {
        let prompt = instruction_prompt(TABLE);
        assert!(!prompt.contains("{tablename}"));
        assert_eq!(prompt.matches(TABLE).count(), 2);
        assert!(prompt.starts_with("Given an input question, construct a syntactically correct SQL query"));
    }

    #[test]
    fn test_question_prompt_order() {
        let question = "What is the proportion of clients offered Prep who accepted Prep";
        let prompt = question_prompt(question, &instruction_prompt(TABLE));

        let refer = prompt.find("You can refer to Given an input question").unwrap();
        let ask = prompt
            .find("Write a SQL query to answer the following question: What is the proportion")
            .unwrap();
        let zero = prompt.find("Skip all operations/groupings that require dividing by zero.").unwrap();
        assert!(refer < ask && ask < zero);
        assert!(prompt.starts_with("Please calculate proportion when asked to"));
        assert!(prompt.contains("do not attempt to generate an answerYou can refer to"));
    }

    #[test]
    fn test_text_to_sql_fills_placeholders() {
        let schema = table_schema("Table 't' has columns: a (text).", "ctx");
        let prompt = text_to_sql_prompt(&schema, "how many?");
        assert!(prompt.contains("syntactically correct postgresql query"));
        assert!(prompt.contains("Table 't' has columns: a (text). The table description is: ctx"));
        assert!(prompt.ends_with("Question: how many?\nSQLQuery: "));
    }

    #[test]
    fn test_schema_without_context() {
        assert_eq!(table_schema("Table 't' has columns: a (text).", ""), "Table 't' has columns: a (text).");
    }
}
