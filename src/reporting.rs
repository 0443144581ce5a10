use crate::model::SavingsReport;
use crate::recommend::Recommendation;

pub fn print_savings_report(report: &SavingsReport, recommendations: &[Recommendation]) {
    println!("\n{report}");
    if report.degraded_schedules > 0 {
        println!(
            "Degraded schedules:    {} (shed not confirmed by the controller)",
            report.degraded_schedules
        );
    }
    println!("\n--- Recommendations ---");
    if recommendations.is_empty() {
        println!("None.");
    }
    for r in recommendations {
        println!("{r}");
    }
}
